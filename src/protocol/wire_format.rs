//! Wire format encoding and decoding.
//!
//! Implements the 11-byte header format:
//! ```text
//! ┌──────────┬───────┬──────────┬──────────┐
//! │ Name len │ Flags │ Req ID   │ Length   │
//! │ 2 bytes  │ 1 byte│ 4 bytes  │ 4 bytes  │
//! │ uint16 BE│       │ uint32 BE│ uint32 BE│
//! └──────────┴───────┴──────────┴──────────┘
//! ```
//!
//! The header is followed by `name_len` bytes of UTF-8 procedure name
//! (requests only) and then `payload_length` bytes of proc-encoded payload.
//!
//! All multi-byte integers are Big Endian.

use bytes::{Buf, BufMut};

use crate::error::{Result, ShipperError};

/// Header size in bytes (fixed, exactly 11).
pub const HEADER_SIZE: usize = 11;

/// Default maximum payload size (1 GB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1_073_741_824;

/// Longest procedure name that fits the header.
pub const MAX_PROCEDURE_NAME_LEN: usize = u16::MAX as usize;

/// Flag constants for the protocol.
pub mod flags {
    /// Message type: response (1) or request (0).
    pub const IS_RESPONSE: u8 = 0b0000_0001;
    /// Error flag: error (1) or ok (0).
    pub const IS_ERROR: u8 = 0b0000_0010;
    /// Payload came from a spilled extra buffer.
    pub const HAS_EXTRA: u8 = 0b0000_0100;

    /// Reserved bits mask (bits 3-7).
    pub const RESERVED_MASK: u8 = 0b1111_1000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }

    /// Request flags.
    pub const REQUEST: u8 = 0;
    /// Response flags.
    pub const RESPONSE: u8 = IS_RESPONSE;
    /// Response whose payload is an extra buffer.
    pub const EXTRA_RESPONSE: u8 = IS_RESPONSE | HAS_EXTRA;
    /// Error response flags.
    pub const ERROR_RESPONSE: u8 = IS_RESPONSE | IS_ERROR;
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Length of the procedure name that follows the header.
    pub name_length: u16,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Request identifier, echoed in the response.
    pub request_id: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(name_length: u16, flags: u8, request_id: u32, payload_length: u32) -> Self {
        Self {
            name_length,
            flags,
            request_id,
            payload_length,
        }
    }

    /// Header for a request carrying `name` and `payload_length` bytes.
    pub fn request(name: &str, request_id: u32, payload_length: u32) -> Result<Self> {
        let name_length = u16::try_from(name.len()).map_err(|_| {
            ShipperError::InvalidArgument(format!(
                "procedure name of {} bytes exceeds {}",
                name.len(),
                MAX_PROCEDURE_NAME_LEN
            ))
        })?;
        Ok(Self::new(name_length, flags::REQUEST, request_id, payload_length))
    }

    /// Header for a response.
    pub fn response(response_flags: u8, request_id: u32, payload_length: u32) -> Self {
        Self::new(0, response_flags | flags::IS_RESPONSE, request_id, payload_length)
    }

    /// The 11 header bytes.
    ///
    /// ```
    /// use function_shipper::protocol::{flags, Header};
    ///
    /// let bytes = Header::response(flags::RESPONSE, 42, 100).encode();
    /// assert_eq!(bytes, [0, 0, 0x01, 0, 0, 0, 42, 0, 0, 0, 100]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_u16(self.name_length);
        cursor.put_u8(self.flags);
        cursor.put_u32(self.request_id);
        cursor.put_u32(self.payload_length);
        buf
    }

    /// Parse the first 11 bytes of `buf`; `None` if it is shorter.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            name_length: buf.get_u16(),
            flags: buf.get_u8(),
            request_id: buf.get_u32(),
            payload_length: buf.get_u32(),
        })
    }

    /// Reject headers no peer may send: reserved bits set, a named response,
    /// an unnamed request, or a payload over `max_payload_size`.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(ShipperError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        if self.is_response() && self.name_length != 0 {
            return Err(ShipperError::Protocol(
                "Responses must not carry a procedure name".to_string(),
            ));
        }

        if !self.is_response() && self.name_length == 0 {
            return Err(ShipperError::Protocol(
                "Requests must name a procedure".to_string(),
            ));
        }

        if self.payload_length > max_payload_size {
            return Err(ShipperError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        Ok(())
    }

    /// Bytes following the header (name + payload).
    #[inline]
    pub fn body_length(&self) -> usize {
        self.name_length as usize + self.payload_length as usize
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_RESPONSE)
    }

    /// Check if this is an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_ERROR)
    }

    /// Check if the payload came from an extra buffer.
    #[inline]
    pub fn has_extra(&self) -> bool {
        flags::has_flag(self.flags, flags::HAS_EXTRA)
    }
}
