//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary framing used on every connection:
//! - 11-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_request, build_response, payload_length, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    flags, Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, MAX_PROCEDURE_NAME_LEN,
};
