//! One decoded frame and helpers that lay frames out contiguously.
//!
//! Name and payload are `Bytes` slices of the read buffer, so a decoding
//! [`Proc`](crate::proc::Proc) can point straight into received data.
//!
//! ```
//! use function_shipper::protocol::{build_request, FrameBuffer};
//!
//! let wire = build_request("bla_open", 42, b"args").unwrap();
//! let frames = FrameBuffer::new().push(&wire).unwrap();
//!
//! assert_eq!(frames[0].procedure().unwrap(), "bla_open");
//! assert_eq!(frames[0].payload(), b"args");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE};
use crate::error::{Result, ShipperError};

#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    /// Procedure name; empty on responses.
    pub name: Bytes,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: Header, name: Bytes, payload: Bytes) -> Self {
        Self {
            header,
            name,
            payload,
        }
    }

    /// Procedure name as UTF-8.
    pub fn procedure(&self) -> Result<&str> {
        std::str::from_utf8(&self.name)
            .map_err(|_| ShipperError::Malformed("procedure name is not UTF-8".to_string()))
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Shared handle on the payload; no copy.
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn request_id(&self) -> u32 {
        self.header.request_id
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }

    #[inline]
    pub fn has_extra(&self) -> bool {
        self.header.has_extra()
    }
}

fn contiguous(header: Header, name: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(HEADER_SIZE + name.len() + payload.len());
    wire.extend_from_slice(&header.encode());
    wire.extend_from_slice(name);
    wire.extend_from_slice(payload);
    wire
}

/// Request frame for `procedure`, laid out in one buffer.
pub fn build_request(procedure: &str, request_id: u32, payload: &[u8]) -> Result<Vec<u8>> {
    let header = Header::request(procedure, request_id, payload_length(payload.len())?)?;
    Ok(contiguous(header, procedure.as_bytes(), payload))
}

/// Response frame; `IS_RESPONSE` is added to `response_flags`.
pub fn build_response(response_flags: u8, request_id: u32, payload: &[u8]) -> Result<Vec<u8>> {
    let header = Header::response(response_flags, request_id, payload_length(payload.len())?);
    Ok(contiguous(header, &[], payload))
}

/// Payload length as the header's u32 field.
pub fn payload_length(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        ShipperError::InvalidArgument(format!("payload of {} bytes does not fit a frame", len))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{flags, FrameBuffer};

    #[test]
    fn test_request_layout() {
        let wire = build_request("bla_open", 7, b"\x00\x2a").unwrap();

        assert_eq!(wire.len(), HEADER_SIZE + 8 + 2);
        assert_eq!(&wire[..3], &[0, 8, flags::REQUEST]);
        assert_eq!(&wire[HEADER_SIZE..HEADER_SIZE + 8], b"bla_open");
        assert_eq!(&wire[HEADER_SIZE + 8..], b"\x00\x2a");
    }

    #[test]
    fn test_response_has_no_name() {
        let wire = build_response(flags::HAS_EXTRA, 456, b"spilled").unwrap();
        let frame = FrameBuffer::new().push(&wire).unwrap().remove(0);

        assert!(frame.is_response() && frame.has_extra() && !frame.is_error());
        assert!(frame.name.is_empty());
        assert_eq!(frame.request_id(), 456);
        assert_eq!(frame.payload(), b"spilled");
    }

    #[test]
    fn test_procedure_must_be_utf8() {
        let frame = Frame::new(
            Header::new(2, flags::REQUEST, 1, 0),
            Bytes::from_static(&[0xC3, 0x28]),
            Bytes::new(),
        );
        assert!(matches!(frame.procedure(), Err(ShipperError::Malformed(_))));
    }

    #[test]
    fn test_payload_bytes_share_storage() {
        let payload = Bytes::from(vec![1u8; 32]);
        let frame = Frame::new(Header::response(0, 3, 32), Bytes::new(), payload.clone());

        assert_eq!(frame.payload_bytes().as_ptr(), payload.as_ptr());
        assert_eq!(frame.payload_len(), 32);
    }
}
