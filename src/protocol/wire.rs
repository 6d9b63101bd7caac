//! Frame preamble encoding and decoding.
//!
//! Every frame starts with a fixed 8-byte preamble:
//! ```text
//! ┌───────────┬───────────┐
//! │ Type      │ Length    │
//! │ 4 bytes   │ 4 bytes   │
//! │ uint32 LE │ uint32 LE │
//! └───────────┴───────────┘
//! ```
//!
//! `Length` counts the whole frame, preamble included. All multi-byte
//! integers on the wire are Little Endian, packed, no padding.

use crate::error::{Error, Result};

/// Preamble size in bytes (fixed, exactly 8).
pub const PREAMBLE_SIZE: usize = 8;

/// Maximum frame size in bytes, preamble included.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol version sent in the handshake.
pub const PROTOCOL_VERSION: u32 = 0x0001_0000;

/// Wire message types.
///
/// Client-originated types and server-originated types occupy disjoint
/// ranges so a frame travelling in the wrong direction is detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    ClHandshake = 0x01,
    ClOpen = 0x02,
    ClWatch = 0x03,
    ClOpenWatch = 0x04,
    ClStat = 0x05,
    ClStatWatch = 0x06,
    ClWatcherOpen = 0x07,
    ClCloseWatcher = 0x08,

    SvHandshakeAck = 0x81,
    SvCommonResponse = 0x82,
    SvEvent = 0x83,
}

impl MessageType {
    /// Decode a message type from its wire value.
    pub fn from_wire(value: u32) -> Option<Self> {
        Some(match value {
            0x01 => MessageType::ClHandshake,
            0x02 => MessageType::ClOpen,
            0x03 => MessageType::ClWatch,
            0x04 => MessageType::ClOpenWatch,
            0x05 => MessageType::ClStat,
            0x06 => MessageType::ClStatWatch,
            0x07 => MessageType::ClWatcherOpen,
            0x08 => MessageType::ClCloseWatcher,
            0x81 => MessageType::SvHandshakeAck,
            0x82 => MessageType::SvCommonResponse,
            0x83 => MessageType::SvEvent,
            _ => return None,
        })
    }

    /// Wire value of this message type.
    #[inline]
    pub fn to_wire(self) -> u32 {
        self as u32
    }

    /// True for client-originated types.
    #[inline]
    pub fn is_client(self) -> bool {
        (self as u32) < 0x80
    }
}

/// Encode a preamble for a frame with `body_len` body bytes.
pub fn encode_preamble(msg_type: MessageType, body_len: usize) -> [u8; PREAMBLE_SIZE] {
    let total = (PREAMBLE_SIZE + body_len) as u32;
    let mut buf = [0u8; PREAMBLE_SIZE];
    buf[0..4].copy_from_slice(&msg_type.to_wire().to_le_bytes());
    buf[4..8].copy_from_slice(&total.to_le_bytes());
    buf
}

/// Decode and validate a preamble.
///
/// Returns the raw message type value and the body length. The type value
/// is left raw so the caller can report an unknown type as a protocol
/// error after the frame has been fully drained.
pub fn decode_preamble(buf: &[u8; PREAMBLE_SIZE]) -> Result<(u32, usize)> {
    let msg_type = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let length = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;

    if length < PREAMBLE_SIZE {
        return Err(Error::Protocol(format!(
            "frame length {} shorter than preamble",
            length
        )));
    }
    if length > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame length {} exceeds maximum {}",
            length, MAX_FRAME_SIZE
        )));
    }

    Ok((msg_type, length - PREAMBLE_SIZE))
}
