//! A small bounded, multi-producer/single-consumer blocking queue used to
//! hand validated messages from the reassembler to whatever is waiting for
//! them (the request engine's completion signal in SPEC_FULL.md §4.2).
//!
//! Built on `std::sync::{Mutex, Condvar}` in the style of a background
//! worker's event/wait pair rather than `std::sync::mpsc`, because callers
//! need a bounded-with-drop push from a non-blocking context and a
//! timed pop, neither of which `mpsc` gives us directly.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedQueue {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
        }
    }

    /// Pushes `item` unless the queue is full, in which case it is dropped
    /// and `false` is returned so the caller can log a warning. Never
    /// blocks: this is what makes it safe to call from a non-blocking
    /// receive callback.
    pub fn try_push(&self, item: T) -> bool {
        let mut guard = self.inner.lock().unwrap();
        if guard.len() >= self.capacity {
            return false;
        }
        guard.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Blocks up to `timeout` for an item to become available.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(item) = guard.pop_front() {
                return Some(item);
            }
            let (next_guard, result) = self.not_empty.wait_timeout(guard, timeout).unwrap();
            guard = next_guard;
            if result.timed_out() {
                return guard.pop_front();
            }
        }
    }

    /// Drops every queued item and wakes any waiter with nothing to show
    /// for it, used when tearing down or re-arming the receiver
    /// expectation between requests.
    pub fn clear(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop() {
        let q: BoundedQueue<u32> = BoundedQueue::new(2);
        assert!(q.try_push(1));
        assert!(q.try_push(2));
        assert!(!q.try_push(3));
        assert_eq!(q.pop_timeout(Duration::from_millis(10)), Some(1));
        assert_eq!(q.pop_timeout(Duration::from_millis(10)), Some(2));
    }

    #[test]
    fn pop_times_out_when_empty() {
        let q: BoundedQueue<u32> = BoundedQueue::new(2);
        assert_eq!(q.pop_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn clear_drops_queued_items() {
        let q: BoundedQueue<u32> = BoundedQueue::new(2);
        q.try_push(1);
        q.clear();
        assert_eq!(q.len(), 0);
    }
}
