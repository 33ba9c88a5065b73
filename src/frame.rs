//! Pure, allocation-free framing: encoding/decoding of control and command
//! frames, SYN/TERM recognition, and the CRC validation predicates the
//! reassembler drives. Nothing in this module blocks or talks to a `Link`.

use byteorder::{ByteOrder, LittleEndian};

use crate::crc16::crc16;

pub const SYN: [u8; 2] = [0xAA, 0x55];
pub const TERM: [u8; 2] = [0xFF, 0xFF];

const LEN_SYN: usize = 2;
const LEN_CTRL: usize = 4;
const LEN_CTRL_CRC: usize = 2;
const LEN_CMD_BASE: usize = 8;
const LEN_CMD_CRC: usize = 2;
const LEN_TERM: usize = 2;

/// Bytes needed before `eval_once` can even look at the control-type byte.
pub const MIN_EVAL_LEN: usize = LEN_SYN + LEN_CTRL;

/// Full length of an ACK/RETRY message (it never carries a payload).
pub const CTRL_MSG_LEN: usize = LEN_SYN + LEN_CTRL + LEN_CTRL_CRC + LEN_TERM;

/// Largest message this crate will ever construct or accept, given
/// `max_payload`.
pub fn max_message_len(max_payload: usize) -> usize {
    LEN_SYN + LEN_CTRL + LEN_CTRL_CRC + LEN_CMD_BASE + max_payload + LEN_CMD_CRC
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Cmd,
    Ack,
    Retry,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Option<FrameType> {
        match b {
            0x80 => Some(FrameType::Cmd),
            0x40 => Some(FrameType::Ack),
            0x04 => Some(FrameType::Retry),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            FrameType::Cmd => 0x80,
            FrameType::Ack => 0x40,
            FrameType::Retry => 0x04,
        }
    }
}

/// The parsed control header (the 4 bytes between SYN and its CRC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub frame_type: FrameType,
    pub len: u8,
    pub seq: u8,
}

/// A validated ACK or RETRY control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPacket {
    pub frame_type: FrameType,
    pub seq: u8,
}

/// A validated command message: either a request/response or an event,
/// classification is left to the caller (it depends on the request-id
/// subspace, which is a `Config` concern, not a framing concern).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage<'a> {
    pub seq: u8,
    pub target_category: u8,
    pub is_response: bool,
    pub instance_id: u8,
    pub request_id: u16,
    pub command_id: u8,
    pub payload: &'a [u8],
}

/// True iff `buf` starts with the SYN marker. Requires `buf.len() >= 2`.
pub fn has_syn(buf: &[u8]) -> bool {
    buf[0] == SYN[0] && buf[1] == SYN[1]
}

fn parse_ctrl_header(buf: &[u8]) -> ControlHeader {
    debug_assert!(buf.len() >= LEN_CTRL);
    ControlHeader {
        // Unwrap is safe: `eval_once` never calls this for an unknown type.
        frame_type: FrameType::from_byte(buf[0]).expect("ctrl type pre-validated"),
        len: buf[1],
        seq: buf[3],
    }
}

/// Checks the CRC16 appended directly after the 4-byte control header.
/// `buf` must start at the control header and contain at least
/// `LEN_CTRL + LEN_CTRL_CRC` bytes.
pub fn ctrl_crc_ok(buf: &[u8]) -> bool {
    let (ctrl, crc_bytes) = buf.split_at(LEN_CTRL);
    let want = LittleEndian::read_u16(&crc_bytes[..LEN_CTRL_CRC]);
    crc16(ctrl) == want
}

/// Checks the CRC16 appended after a command frame + its payload. `buf`
/// must start at the command frame and contain at least
/// `LEN_CMD_BASE + payload_len + LEN_CMD_CRC` bytes.
pub fn cmd_crc_ok(buf: &[u8], payload_len: usize) -> bool {
    let covered_len = LEN_CMD_BASE + payload_len;
    let (covered, crc_bytes) = buf.split_at(covered_len);
    let want = LittleEndian::read_u16(&crc_bytes[..LEN_CMD_CRC]);
    crc16(covered) == want
}

/// True iff `buf` starts with the TERM marker. Requires `buf.len() >= 2`.
pub fn has_term(buf: &[u8]) -> bool {
    buf[0] == TERM[0] && buf[1] == TERM[1]
}

/// Parses a previously CRC/TERM-validated ACK or RETRY message. `buf` must
/// be exactly `CTRL_MSG_LEN` bytes, starting at SYN.
pub fn parse_control_packet(buf: &[u8]) -> ControlPacket {
    let header = parse_ctrl_header(&buf[LEN_SYN..]);
    ControlPacket {
        frame_type: header.frame_type,
        seq: header.seq,
    }
}

/// Parses a previously CRC-validated command message (request, response, or
/// event). `buf` must start at SYN and contain exactly
/// `LEN_SYN + LEN_CTRL + LEN_CTRL_CRC + LEN_CMD_BASE + payload_len +
/// LEN_CMD_CRC` bytes.
pub fn parse_command_message(buf: &[u8]) -> CommandMessage<'_> {
    let ctrl = parse_ctrl_header(&buf[LEN_SYN..]);
    let cmd_start = LEN_SYN + LEN_CTRL + LEN_CTRL_CRC;
    let cmd = &buf[cmd_start..];

    let flags1 = cmd[2];
    let flags2 = cmd[3];
    let request_id = LittleEndian::read_u16(&cmd[5..7]);
    let payload_len = ctrl.len as usize - LEN_CMD_BASE;
    let payload = &cmd[LEN_CMD_BASE..LEN_CMD_BASE + payload_len];

    CommandMessage {
        seq: ctrl.seq,
        target_category: cmd[1],
        is_response: flags1 == 0x00 && flags2 == 0x01,
        instance_id: cmd[4],
        request_id,
        command_id: cmd[7],
        payload,
    }
}

fn write_ctrl(buf: &mut [u8], frame_type: FrameType, len: u8, seq: u8) -> usize {
    buf[0] = frame_type.as_byte();
    buf[1] = len;
    buf[2] = 0x00;
    buf[3] = seq;
    let crc = crc16(&buf[..LEN_CTRL]);
    LittleEndian::write_u16(&mut buf[LEN_CTRL..LEN_CTRL + LEN_CTRL_CRC], crc);
    LEN_CTRL + LEN_CTRL_CRC
}

/// Encodes an ACK message (`SYN ctrl crc(ctrl) TERM`) into `buf`, returning
/// the number of bytes written.
pub fn encode_ack(buf: &mut [u8], seq: u8) -> usize {
    encode_control_message(buf, FrameType::Ack, seq)
}

/// Encodes a RETRY message into `buf`, returning the number of bytes
/// written.
pub fn encode_retry(buf: &mut [u8], seq: u8) -> usize {
    encode_control_message(buf, FrameType::Retry, seq)
}

fn encode_control_message(buf: &mut [u8], frame_type: FrameType, seq: u8) -> usize {
    buf[..LEN_SYN].copy_from_slice(&SYN);
    let n = write_ctrl(&mut buf[LEN_SYN..], frame_type, 0, seq);
    let term_at = LEN_SYN + n;
    buf[term_at..term_at + LEN_TERM].copy_from_slice(&TERM);
    term_at + LEN_TERM
}

/// Parameters for encoding a command message (request, response, or event).
/// Re-encoding the same `CommandFields` always produces identical bytes,
/// which is what makes byte-identical retries possible.
#[derive(Debug, Clone, Copy)]
pub struct CommandFields {
    pub seq: u8,
    pub target_category: u8,
    pub is_response: bool,
    pub instance_id: u8,
    pub request_id: u16,
    pub command_id: u8,
}

/// Encodes a full command message (request/response/event shape: `SYN ctrl
/// crc(ctrl) cmdframe crc(cmdframe)`, no TERM) into `buf`, returning the
/// number of bytes written.
pub fn encode_command_message(buf: &mut [u8], fields: CommandFields, payload: &[u8]) -> usize {
    buf[..LEN_SYN].copy_from_slice(&SYN);

    let ctrl_len = (LEN_CMD_BASE + payload.len()) as u8;
    let n = write_ctrl(&mut buf[LEN_SYN..], FrameType::Cmd, ctrl_len, fields.seq);
    let cmd_start = LEN_SYN + n;

    let (f1, f2) = if fields.is_response { (0x00, 0x01) } else { (0x01, 0x00) };
    {
        let cmd = &mut buf[cmd_start..];
        cmd[0] = FrameType::Cmd.as_byte();
        cmd[1] = fields.target_category;
        cmd[2] = f1;
        cmd[3] = f2;
        cmd[4] = fields.instance_id;
        LittleEndian::write_u16(&mut cmd[5..7], fields.request_id);
        cmd[7] = fields.command_id;
        cmd[LEN_CMD_BASE..LEN_CMD_BASE + payload.len()].copy_from_slice(payload);
    }

    let crc_at = cmd_start + LEN_CMD_BASE + payload.len();
    let crc = crc16(&buf[cmd_start..crc_at]);
    LittleEndian::write_u16(&mut buf[crc_at..crc_at + LEN_CMD_CRC], crc);

    crc_at + LEN_CMD_CRC
}
