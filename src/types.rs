//! The request/response data model callers interact with (SPEC_FULL.md §3).

use crate::error::{Error, Result};

/// A logical request issued by a client driver (HID keyboard, battery,
/// ...). `target_id` selects which physical SSH channel to address; this
/// crate only ever drives one link, so it is accepted for API fidelity
/// with multi-link deployments but is not encoded into the wire frame
/// (multi-link aggregation is explicitly out of scope, SPEC_FULL.md §1).
#[derive(Debug, Clone)]
pub struct Request {
    pub target_category: u8,
    pub target_id: u8,
    pub instance_id: u8,
    pub command_id: u8,
    /// "send-needs-response": the EC is expected to return a response
    /// frame in addition to the ACK.
    pub snc: bool,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(target_category: u8, target_id: u8, instance_id: u8, command_id: u8) -> Self {
        Request {
            target_category,
            target_id,
            instance_id,
            command_id,
            snc: false,
            payload: Vec::new(),
        }
    }

    pub fn with_snc(mut self, snc: bool) -> Self {
        self.snc = snc;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }
}

/// A caller-owned region a response payload is copied into. Mirrors the
/// "capacity / filled length / data owned by caller" shape from
/// SPEC_FULL.md §3 instead of allocating on the transport's behalf.
pub struct ResponseBuffer<'a> {
    data: &'a mut [u8],
    filled: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        ResponseBuffer { data, filled: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn filled_len(&self) -> usize {
        self.filled
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    pub(crate) fn fill(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.data.len() {
            return Err(Error::protocol_violation("response buffer too small"));
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.filled = bytes.len();
        Ok(())
    }
}
