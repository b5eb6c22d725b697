//! Frame-level wire contract shared by the client and the server (C1).
//!
//! A frame is `type ‖ uint64_be(len(payload)) ‖ payload`; a response is a
//! single byte. See spec §3 and §6.1 for the bit-exact layout.

use thiserror::Error;

/// Ceiling on a single frame's payload, enforced before any allocation or
/// read is attempted against an advertised length.
pub const MAX_PAYLOAD_LEN: u64 = 1024 * 1024;

/// One of the four fixed, NUL-padded 6-byte type literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Start,
    End,
    Data,
    Cancel,
}

impl MessageType {
    pub const fn literal(self) -> [u8; 6] {
        match self {
            MessageType::Start => *b"START\0",
            MessageType::End => *b"END\0\0\0",
            MessageType::Data => *b"DATA\0\0",
            MessageType::Cancel => *b"CANCEL",
        }
    }

    pub fn from_literal(bytes: [u8; 6]) -> Option<Self> {
        match &bytes {
            b"START\0" => Some(MessageType::Start),
            b"END\0\0\0" => Some(MessageType::End),
            b"DATA\0\0" => Some(MessageType::Data),
            b"CANCEL" => Some(MessageType::Cancel),
            _ => None,
        }
    }
}

/// The single response byte the server sends back per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Success,
    FileAlreadyInFlight,
    Error,
}

impl Response {
    pub const fn byte(self) -> u8 {
        match self {
            Response::Success => 0x00,
            Response::FileAlreadyInFlight => 0x11,
            Response::Error => 0xFF,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Response::Success),
            0x11 => Some(Response::FileAlreadyInFlight),
            0xFF => Some(Response::Error),
            _ => None,
        }
    }
}

/// Errors raised while decoding a frame header or enforcing the payload
/// ceiling. Distinct from transport-level I/O errors, which callers wrap
/// separately (`ClientError`, `DispatchError`).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unrecognized message type literal: {0:02x?}")]
    MalformedType([u8; 6]),
    #[error("peer closed mid-frame")]
    ShortRead,
    #[error("payload length {len} exceeds the {max}-byte ceiling")]
    OversizedPayload { len: u64, max: u64 },
}

/// Encodes a complete frame: type literal, then the big-endian length of
/// `payload`, then `payload` itself.
pub fn encode_frame(msg_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6 + 8 + payload.len());
    buf.extend_from_slice(&msg_type.literal());
    buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Rejects a decoded length against the configured ceiling before any
/// buffer is sized from it (§4.1: a hostile length prefix must not drive
/// allocation).
pub fn check_payload_len(len: u64) -> Result<(), CodecError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(CodecError::OversizedPayload {
            len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok(())
}
