//! The seam onto the externally configured byte-duplex UART link
//! (SPEC_FULL.md §4.6 / §6). Everything above this trait is payload- and
//! hardware-agnostic; a link configurator elsewhere picks the baud rate,
//! parity, and flow control and hands the core an already-open `Link`.

use std::time::Duration;

use crate::error::Result;

/// A non-blocking write with a completion deadline, and a place to install
/// the receive callback. Implementations must invoke the installed
/// callback from some thread whenever bytes arrive; that thread must not
/// block waiting on anything this crate owns (SPEC_FULL.md §5, "IRQ-context
/// receive callback").
pub trait Link: Send + Sync {
    /// Writes the entirety of `data`, returning an error if it cannot
    /// complete within `timeout`.
    fn write(&self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Installs the callback invoked with each chunk of inbound bytes.
    /// Called exactly once, during `Controller::new`.
    fn set_receiver(&self, callback: Box<dyn Fn(&[u8]) + Send + Sync + 'static>);
}
