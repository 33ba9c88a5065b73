//! Event dispatch: unsolicited command messages from the EC are ACKed on a
//! dedicated single-worker queue (so ACK ordering matches arrival order) and
//! routed to a registered handler on a separate multi-worker queue. See
//! SPEC_FULL.md §4.4.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::Config;
use crate::controller::ControllerState;
use crate::error::{Error, Result};
use crate::frame::{self, CommandFields};
use crate::link::Link;
use crate::reassembler::OwnedCommandMessage;
use crate::workqueue::WorkQueue;

/// An unsolicited message pushed by the EC, handed to a registered handler.
#[derive(Debug, Clone)]
pub struct Event {
    pub target_category: u8,
    pub instance_id: u8,
    pub command_id: u8,
    pub request_id: u16,
    pub payload: Vec<u8>,
}

impl From<OwnedCommandMessage> for Event {
    fn from(m: OwnedCommandMessage) -> Self {
        Event {
            target_category: m.target_category,
            instance_id: m.instance_id,
            command_id: m.command_id,
            request_id: m.request_id,
            payload: m.payload,
        }
    }
}

/// When a handler runs relative to its triggering event. `Immediate` runs
/// inline on the handler-queue worker as soon as the event is dequeued;
/// `After` defers it by a fixed duration (used by drivers that need to
/// coalesce bursty sources).
#[derive(Debug, Clone, Copy)]
pub enum Delay {
    Immediate,
    After(Duration),
}

type Handler = dyn Fn(&Event) -> i32 + Send + Sync;
type DelayFn = dyn Fn(&Event) -> Delay + Send + Sync;

struct Subscription {
    handler: Box<Handler>,
    delay_fn: Option<Box<DelayFn>>,
}

/// Owns the subscription registry and the two work queues. One instance
/// lives for the lifetime of a `Controller`.
pub struct EventDispatcher {
    subscriptions: RwLock<HashMap<u16, Arc<Subscription>>>,
    ack_queue: WorkQueue,
    handler_queue: WorkQueue,
    controller_state: Arc<RwLock<ControllerState>>,
}

impl EventDispatcher {
    /// `controller_state` is the same handle the controller's lifecycle
    /// state lives behind, so the ack-work can re-check it (SPEC_FULL.md
    /// §4.4 step 2: an event that arrives while suspended is still
    /// reassembled, but must not be acked).
    pub fn new(config: &Config, controller_state: Arc<RwLock<ControllerState>>) -> Self {
        EventDispatcher {
            subscriptions: RwLock::new(HashMap::new()),
            ack_queue: WorkQueue::new("ssh-ack", 1),
            handler_queue: WorkQueue::new("ssh-event", config.event_workers.max(1)),
            controller_state,
        }
    }

    pub fn set_event_handler<F>(&self, config: &Config, rqid: u16, handler: F) -> Result<()>
    where
        F: Fn(&Event) -> i32 + Send + Sync + 'static,
    {
        self.set_event_handler_inner(config, rqid, Box::new(handler), None)
    }

    pub fn set_delayed_event_handler<F, D>(
        &self,
        config: &Config,
        rqid: u16,
        handler: F,
        delay_fn: D,
    ) -> Result<()>
    where
        F: Fn(&Event) -> i32 + Send + Sync + 'static,
        D: Fn(&Event) -> Delay + Send + Sync + 'static,
    {
        self.set_event_handler_inner(config, rqid, Box::new(handler), Some(Box::new(delay_fn)))
    }

    fn set_event_handler_inner(
        &self,
        config: &Config,
        rqid: u16,
        handler: Box<Handler>,
        delay_fn: Option<Box<DelayFn>>,
    ) -> Result<()> {
        if !config.is_event_id(rqid) {
            return Err(Error::invalid_argument(
                "rqid is not in the event id subspace",
            ));
        }
        let sub = Arc::new(Subscription { handler, delay_fn });
        self.subscriptions.write().unwrap().insert(rqid, sub);
        Ok(())
    }

    /// Unregisters the handler for `rqid`, if any, and blocks until no
    /// invocation of it remains in flight.
    pub fn remove_event_handler(&self, rqid: u16) {
        self.subscriptions.write().unwrap().remove(&rqid);
        self.handler_queue.flush();
    }

    /// Called from the controller's receive path for every command message
    /// classified as an event. Always schedules an ACK; dispatches to the
    /// registered handler (if any) according to its configured delay.
    pub fn dispatch(&self, msg: OwnedCommandMessage, link: Arc<dyn Link>) {
        let ack_seq = msg.seq;
        let controller_state = self.controller_state.clone();
        self.ack_queue.submit(move || {
            if *controller_state.read().unwrap() != ControllerState::Initialized {
                log::debug!("controller not initialized, skipping ack for seq={}", ack_seq);
                return;
            }
            let mut buf = [0u8; frame::CTRL_MSG_LEN];
            let n = frame::encode_ack(&mut buf, ack_seq);
            if let Err(e) = link.write(&buf[..n], Duration::from_millis(1000)) {
                log::warn!("failed to ack event seq={}: {}", ack_seq, e);
            }
        });

        let event: Event = msg.into();
        let sub = {
            let subs = self.subscriptions.read().unwrap();
            subs.get(&event.request_id).cloned()
        };

        let sub = match sub {
            Some(sub) => sub,
            None => {
                log::warn!("no handler registered for event rqid={}", event.request_id);
                return;
            }
        };

        let delay = match &sub.delay_fn {
            Some(f) => f(&event),
            None => Delay::Immediate,
        };

        match delay {
            Delay::Immediate => run_handler(&sub, &event),
            Delay::After(d) => {
                self.handler_queue.submit(move || {
                    std::thread::sleep(d);
                    run_handler(&sub, &event);
                });
            }
        }
    }

    /// Blocks until every queued ACK and handler invocation has completed.
    /// Used on teardown.
    pub fn flush(&self) {
        self.ack_queue.flush();
        self.handler_queue.flush();
    }
}

fn run_handler(sub: &Subscription, event: &Event) {
    let status = (sub.handler)(event);
    if status != 0 {
        log::warn!(
            "event handler for rqid={} returned non-zero status {}",
            event.request_id,
            status
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::LoopbackLink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn initialized_state() -> Arc<RwLock<ControllerState>> {
        Arc::new(RwLock::new(ControllerState::Initialized))
    }

    fn event_msg(rqid: u16) -> OwnedCommandMessage {
        OwnedCommandMessage {
            seq: 9,
            target_category: 0x08,
            is_response: false,
            instance_id: 0,
            request_id: rqid,
            command_id: 0x01,
            payload: vec![0x42],
        }
    }

    #[test]
    fn missing_handler_still_acks() {
        let cfg = Config::default();
        let link = LoopbackLink::new();
        let dispatcher = EventDispatcher::new(&cfg, initialized_state());
        dispatcher.dispatch(event_msg(cfg.event_mask()), link.clone());
        dispatcher.flush();
        assert_eq!(link.written_messages().len(), 1);
    }

    #[test]
    fn suspended_controller_skips_the_ack() {
        let cfg = Config::default();
        let link = LoopbackLink::new();
        let state = Arc::new(RwLock::new(ControllerState::Suspended));
        let dispatcher = EventDispatcher::new(&cfg, state);
        dispatcher.dispatch(event_msg(cfg.event_mask()), link.clone());
        dispatcher.flush();
        assert_eq!(link.written_messages().len(), 0);
    }

    #[test]
    fn registered_handler_runs_immediately_and_acks() {
        let cfg = Config::default();
        let link = LoopbackLink::new();
        let dispatcher = EventDispatcher::new(&cfg, initialized_state());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let rqid = cfg.event_mask();
        dispatcher
            .set_event_handler(&cfg, rqid, move |event| {
                seen2.lock().unwrap().push(event.payload.clone());
                0
            })
            .unwrap();

        dispatcher.dispatch(event_msg(rqid), link.clone());
        dispatcher.flush();

        assert_eq!(link.written_messages().len(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![vec![0x42]]);
    }

    #[test]
    fn remove_event_handler_waits_for_in_flight_invocations() {
        let cfg = Config::default();
        let link = LoopbackLink::new();
        let dispatcher = EventDispatcher::new(&cfg, initialized_state());
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let rqid = cfg.event_mask();
        dispatcher
            .set_delayed_event_handler(
                &cfg,
                rqid,
                move |_event| {
                    ran2.fetch_add(1, Ordering::SeqCst);
                    0
                },
                |_event| Delay::After(Duration::from_millis(20)),
            )
            .unwrap();

        dispatcher.dispatch(event_msg(rqid), link);
        dispatcher.remove_event_handler(rqid);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejects_rqid_outside_event_subspace() {
        let cfg = Config::default();
        let dispatcher = EventDispatcher::new(&cfg, initialized_state());
        let result = dispatcher.set_event_handler(&cfg, 2, |_event| 0);
        assert!(result.is_err());
    }
}
