//! A tiny fixed-size thread pool backing the two deferred-work queues in
//! SPEC_FULL.md §4.4: a single-worker pool for ACK emission (its ordering
//! is load-bearing) and a multi-worker pool for event handlers.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkQueue {
    sender: Option<mpsc::Sender<Job>>,
    outstanding: Arc<(Mutex<usize>, Condvar)>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkQueue {
    /// Spawns `num_workers` threads, all pulling from the same job queue.
    /// `name` is used as a thread-naming prefix for easier debugging.
    pub fn new(name: &str, num_workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let outstanding = Arc::new((Mutex::new(0usize), Condvar::new()));

        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let receiver = receiver.clone();
            let outstanding = outstanding.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || worker_loop(receiver, outstanding))
                .expect("failed to spawn work queue thread");
            workers.push(handle);
        }

        WorkQueue {
            sender: Some(sender),
            outstanding,
            workers,
        }
    }

    /// Schedules `job` to run on one of the pool's worker threads.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, job: F) {
        {
            let (lock, _) = &*self.outstanding;
            *lock.lock().unwrap() += 1;
        }

        let sent = self
            .sender
            .as_ref()
            .expect("work queue used after shutdown")
            .send(Box::new(job));

        if sent.is_err() {
            // Workers are gone (shouldn't happen before `Drop`); undo the
            // bump so `flush` doesn't wait forever.
            self.mark_one_done();
        }
    }

    fn mark_one_done(&self) {
        let (lock, cvar) = &*self.outstanding;
        let mut count = lock.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            cvar.notify_all();
        }
    }

    /// Blocks until every job submitted so far has finished running. Used
    /// on unsubscribe (so no handler reference remains in flight) and on
    /// teardown.
    pub fn flush(&self) {
        let (lock, cvar) = &*self.outstanding;
        let mut count = lock.lock().unwrap();
        while *count > 0 {
            count = cvar.wait(count).unwrap();
        }
    }
}

fn worker_loop(
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    outstanding: Arc<(Mutex<usize>, Condvar)>,
) {
    loop {
        let job = {
            let recv = receiver.lock().unwrap();
            recv.recv()
        };
        match job {
            Ok(job) => {
                job();
                let (lock, cvar) = &*outstanding;
                let mut count = lock.lock().unwrap();
                *count -= 1;
                if *count == 0 {
                    cvar.notify_all();
                }
            }
            Err(_) => break,
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        // Dropping the sender closes the channel, which unblocks every
        // worker's `recv()` with an error and lets its loop exit.
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
