//! Wire protocol: preamble handling and the fixed message set.
//!
//! The codec is pure: it works on byte buffers only, so it can be tested
//! without any socket. Framing I/O lives in [`crate::transport`].

mod messages;
mod wire;

pub use messages::{ClientMessage, CommonResponse, ResourceOp, ServerMessage};
pub use wire::{
    decode_preamble, encode_preamble, MessageType, MAX_FRAME_SIZE, PREAMBLE_SIZE, PROTOCOL_VERSION,
};
