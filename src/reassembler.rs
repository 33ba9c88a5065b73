//! Converts a best-effort byte stream, delivered in arbitrarily sized
//! chunks, into a sequence of validated logical messages. See SPEC_FULL.md
//! §4.2. This type does no locking and no I/O: the controller owns one
//! behind its receiver lock and feeds it from the link's receive callback.

use crate::frame::{
    self, CommandMessage, ControlPacket, FrameType,
};

/// A fully validated inbound message, ready to be routed by the caller
/// (request engine for control packets / non-event commands, event
/// dispatcher for event commands).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingMessage {
    Control(ControlPacket),
    Command(OwnedCommandMessage),
}

/// Owned counterpart of `frame::CommandMessage`, since messages must outlive
/// the reassembler's internal buffer once handed off to a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedCommandMessage {
    pub seq: u8,
    pub target_category: u8,
    pub is_response: bool,
    pub instance_id: u8,
    pub request_id: u16,
    pub command_id: u8,
    pub payload: Vec<u8>,
}

impl<'a> From<CommandMessage<'a>> for OwnedCommandMessage {
    fn from(m: CommandMessage<'a>) -> Self {
        OwnedCommandMessage {
            seq: m.seq,
            target_category: m.target_category,
            is_response: m.is_response,
            instance_id: m.instance_id,
            request_id: m.request_id,
            command_id: m.command_id,
            payload: m.payload.to_vec(),
        }
    }
}

/// The sliding evaluation buffer: holds a prefix of the inbound byte stream
/// that has not yet formed a complete, validated message. Never loses or
/// reorders bytes.
pub struct Reassembler {
    buf: Vec<u8>,
    capacity: usize,
}

impl Reassembler {
    pub fn new(capacity: usize) -> Self {
        Reassembler {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `chunk` (as much as fits) and evaluates it until no further
    /// progress can be made, returning every message that became available.
    pub fn feed(&mut self, chunk: &[u8], max_payload: usize) -> Vec<IncomingMessage> {
        let room = self.capacity.saturating_sub(self.buf.len());
        let take = chunk.len().min(room);
        self.buf.extend_from_slice(&chunk[..take]);
        if take < chunk.len() {
            log::warn!(
                "reassembler buffer full: dropping {} inbound bytes",
                chunk.len() - take
            );
        }

        let mut out = Vec::new();
        loop {
            let (consumed, message) = eval_once(&self.buf, max_payload);
            if consumed == 0 {
                break;
            }
            if let Some(message) = message {
                out.push(message);
            }
            self.buf.drain(0..consumed);
        }
        out
    }
}

/// One step of the reassembly policy: either "need more bytes" (returns
/// `(0, None)`) or "consume N bytes" (returns `(n, message)`, where
/// `message` is `None` when the consumed bytes were corrupt and discarded).
fn eval_once(buf: &[u8], max_payload: usize) -> (usize, Option<IncomingMessage>) {
    let size = buf.len();
    if size < frame::MIN_EVAL_LEN {
        return (0, None);
    }

    if !frame::has_syn(buf) {
        log::warn!("reassembler: missing SYN, discarding {} buffered bytes", size);
        return (size, None);
    }

    let type_byte = buf[2];
    let frame_type = match FrameType::from_byte(type_byte) {
        Some(t) => t,
        None => {
            log::warn!("reassembler: unknown frame type 0x{:02x}, discarding all", type_byte);
            return (size, None);
        }
    };

    match frame_type {
        FrameType::Ack | FrameType::Retry => eval_control(buf, size),
        FrameType::Cmd => eval_command(buf, size, max_payload),
    }
}

fn eval_control(buf: &[u8], size: usize) -> (usize, Option<IncomingMessage>) {
    if size < frame::CTRL_MSG_LEN {
        return (0, None);
    }

    let ctrl_crc_region = &buf[2..2 + 6];
    let term_region = &buf[2 + 6..frame::CTRL_MSG_LEN];

    if !frame::has_term(term_region) {
        log::warn!("reassembler: invalid TERM on control message, discarding all");
        return (size, None);
    }

    if !frame::ctrl_crc_ok(ctrl_crc_region) {
        log::warn!("reassembler: control CRC mismatch, discarding this message");
        return (frame::CTRL_MSG_LEN, None);
    }

    let packet = frame::parse_control_packet(&buf[..frame::CTRL_MSG_LEN]);
    (frame::CTRL_MSG_LEN, Some(IncomingMessage::Control(packet)))
}

fn eval_command(buf: &[u8], size: usize, max_payload: usize) -> (usize, Option<IncomingMessage>) {
    const LEN_SYN: usize = 2;
    const LEN_CTRL: usize = 4;
    const LEN_CTRL_CRC: usize = 2;
    const LEN_CMD_BASE: usize = 8;
    const LEN_CMD_CRC: usize = 2;

    if size < LEN_SYN + LEN_CTRL + LEN_CTRL_CRC {
        return (0, None);
    }

    let ctrl_crc_region = &buf[LEN_SYN..LEN_SYN + LEN_CTRL + LEN_CTRL_CRC];
    if !frame::ctrl_crc_ok(ctrl_crc_region) {
        // The length field itself cannot be trusted, so we cannot know how
        // much of the stream is this message: discard everything buffered.
        log::warn!("reassembler: command ctrl CRC mismatch, discarding all");
        return (size, None);
    }

    let ctrl_len = buf[LEN_SYN + 1] as usize;
    if ctrl_len < LEN_CMD_BASE || ctrl_len - LEN_CMD_BASE > max_payload {
        log::warn!("reassembler: implausible command length {}, discarding all", ctrl_len);
        return (size, None);
    }

    let needed = LEN_SYN + LEN_CTRL + LEN_CTRL_CRC + ctrl_len + LEN_CMD_CRC;
    if size < needed {
        return (0, None);
    }

    let cmd_start = LEN_SYN + LEN_CTRL + LEN_CTRL_CRC;
    let payload_len = ctrl_len - LEN_CMD_BASE;
    if !frame::cmd_crc_ok(&buf[cmd_start..needed], payload_len) {
        log::warn!("reassembler: command CRC mismatch, discarding this message");
        return (needed, None);
    }

    let msg = frame::parse_command_message(&buf[..needed]);
    (needed, Some(IncomingMessage::Command(msg.into())))
}
