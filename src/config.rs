//! Tunable parameters of the transport, gathered in one place instead of
//! being scattered literals (§6 Configurable parameters).

use std::time::Duration;

/// Event request-ids are the ones whose low `event_bits` bits are all set
/// (and are non-zero). Everything else is a request/response id.
pub const DEFAULT_EVENT_BITS: u32 = 5;

/// Matches the EC command set this transport has been observed against.
pub const DEFAULT_MAX_PAYLOAD: usize = 128;

/// Size of the inbound reassembly FIFO handed from the receiver to the
/// request engine / event dispatcher. Must be a power of two.
pub const DEFAULT_FIFO_LEN: usize = 512;

#[derive(Debug, Clone)]
pub struct Config {
    /// Deadline for a single write to the link to complete.
    pub write_timeout: Duration,

    /// Deadline to wait for an ACK, a retry notice, or a response.
    pub read_timeout: Duration,

    /// Total number of attempts the request engine makes to get a request
    /// ACKed before giving up (not a resend count on top of a first try).
    pub num_retry: u32,

    /// Largest payload, in bytes, the transport will encode into a command
    /// frame. EC-defined; the default matches the observed command set.
    pub max_payload: usize,

    /// Number of low bits of a request-id that mark it as belonging to the
    /// event subspace. EC-defined.
    pub event_bits: u32,

    /// Depth of the inbound reassembly FIFO.
    pub fifo_len: usize,

    /// Number of worker threads servicing the event-handler queue. The
    /// ACK queue is always single-threaded (its ordering is load-bearing).
    pub event_workers: usize,

    /// A legacy Surface quirk: short-circuit the base-status request
    /// (tc=0x11, iid=0x00, cid=0x0D, snc=1) to a literal `0x01` byte instead
    /// of sending it to the EC, to break a lid-notify loop observed on some
    /// firmware revisions. Off by default; see the Open Question in
    /// SPEC_FULL.md §9.
    pub legacy_base_status_quirk: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            write_timeout: Duration::from_millis(1000),
            read_timeout: Duration::from_millis(1000),
            num_retry: 3,
            max_payload: DEFAULT_MAX_PAYLOAD,
            event_bits: DEFAULT_EVENT_BITS,
            fifo_len: DEFAULT_FIFO_LEN,
            event_workers: 4,
            legacy_base_status_quirk: false,
        }
    }
}

impl Config {
    /// Mask applied to a request-id to test whether it falls in the event
    /// subspace.
    pub fn event_mask(&self) -> u16 {
        ((1u32 << self.event_bits) - 1) as u16
    }

    /// An id is an event id iff all of its low `event_bits` bits are set
    /// and it is non-zero.
    pub fn is_event_id(&self, rqid: u16) -> bool {
        rqid != 0 && (rqid & self.event_mask()) == self.event_mask()
    }
}
