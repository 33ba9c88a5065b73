//! An in-memory loopback `Link` used by this crate's own integration tests
//! (and available to downstream crates that want to exercise the
//! transport without real hardware). Not part of the production wire path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::link::Link;

type Responder = dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send;

pub struct LoopbackLink {
    written: Mutex<Vec<Vec<u8>>>,
    callback: Mutex<Option<Box<dyn Fn(&[u8]) + Send + Sync>>>,
    responder: Mutex<Option<Box<Responder>>>,
    fail_writes: AtomicBool,
}

impl LoopbackLink {
    pub fn new() -> Arc<Self> {
        Arc::new(LoopbackLink {
            written: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
            responder: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Installs a function invoked synchronously with every write the
    /// transport performs; whatever it returns (if anything) is delivered
    /// back to the transport's receive callback as if it had arrived on
    /// the wire.
    pub fn set_responder<F>(&self, f: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(f));
    }

    /// Every message this link has been asked to write, in order.
    pub fn written_messages(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    /// Feeds `bytes` into the transport's receive callback, as if they had
    /// just arrived from the peer.
    pub fn deliver(&self, bytes: &[u8]) {
        let callback = self.callback.lock().unwrap();
        if let Some(callback) = callback.as_ref() {
            callback(bytes);
        }
    }

    /// Makes every subsequent `write` fail, to simulate a dead link.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Link for LoopbackLink {
    fn write(&self, data: &[u8], _timeout: Duration) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::LinkWriteFailed(failure::err_msg(
                "simulated link failure",
            )));
        }

        self.written.lock().unwrap().push(data.to_vec());

        let reply = {
            let mut responder = self.responder.lock().unwrap();
            responder.as_mut().and_then(|f| f(data))
        };
        if let Some(reply) = reply {
            self.deliver(&reply);
        }

        Ok(())
    }

    fn set_receiver(&self, callback: Box<dyn Fn(&[u8]) + Send + Sync + 'static>) {
        *self.callback.lock().unwrap() = Some(callback);
    }
}
