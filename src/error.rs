//! Error taxonomy surfaced to callers of the transport.

pub use failure::Error as AnyError;

pub type Result<T> = core::result::Result<T, Error>;

/// All of the ways a request or a lifecycle operation on the controller can
/// fail. Local recovery from wire-level noise (bad CRCs, mismatched
/// sequence/request-id, unsolicited responses) never surfaces here: it is
/// logged and discarded by the reassembler, and the caller eventually just
/// sees `Timeout`.
#[derive(Debug, Fail)]
pub enum Error {
    /// The controller has not been initialized yet (no `probe`/`new` has
    /// completed).
    #[fail(display = "controller is not initialized")]
    NotInitialized,

    /// The controller is suspended; requests are rejected until resumed.
    #[fail(display = "controller is suspended")]
    Suspended,

    /// A caller-supplied argument violates a protocol constraint.
    #[fail(display = "invalid argument: {}", reason)]
    InvalidArgument { reason: &'static str },

    /// The underlying link failed to accept a write.
    #[fail(display = "link write failed: {}", _0)]
    LinkWriteFailed(AnyError),

    /// No ACK or response arrived at all within `timeout * retries`: every
    /// attempt drew silence.
    #[fail(display = "request timed out after all retries")]
    Timeout,

    /// The EC explicitly asked for a retry on every attempt; the link is
    /// live but the request never got through.
    #[fail(display = "retries exhausted")]
    RetriesExhausted,

    /// A response arrived but could not be accepted as framed (used only
    /// where the violation cannot simply be discarded and retried, e.g. a
    /// response buffer too small to hold the payload).
    #[fail(display = "protocol violation: {}", reason)]
    ProtocolViolation { reason: &'static str },

    /// A buffer or work-item allocation failed.
    #[fail(display = "out of memory")]
    OutOfMemory,
}

impl Error {
    pub fn invalid_argument(reason: &'static str) -> Self {
        Error::InvalidArgument { reason }
    }

    pub fn protocol_violation(reason: &'static str) -> Self {
        Error::ProtocolViolation { reason }
    }
}
