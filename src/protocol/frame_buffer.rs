//! Reassembly of frames from a byte stream.
//!
//! Socket reads split frames anywhere: inside the header, the procedure name
//! or the payload. [`FrameBuffer`] keeps the unconsumed tail in one
//! `BytesMut` and cuts complete frames off the front, so names and payloads
//! are frozen views of the read buffer rather than copies.
//!
//! ```
//! use function_shipper::protocol::{build_request, FrameBuffer};
//!
//! let wire = build_request("bla_open", 1, b"args").unwrap();
//! let mut buffer = FrameBuffer::new();
//!
//! assert!(buffer.push(&wire[..7]).unwrap().is_empty());
//! let frames = buffer.push(&wire[7..]).unwrap();
//! assert_eq!(frames[0].procedure().unwrap(), "bla_open");
//! ```

use bytes::BytesMut;

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::{Result, ShipperError};

/// Initial read-buffer reservation.
const INITIAL_CAPACITY: usize = 64 * 1024;

/// Accumulates stream bytes and yields complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
    /// Header already taken off the front, waiting for its body.
    pending: Option<Header>,
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Frame buffer accepting payloads up to 1 GB.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            pending: None,
            max_payload_size,
        }
    }

    /// Append `data` and return every frame it completes.
    ///
    /// # Errors
    ///
    /// A header that fails validation. The stream cannot be resynchronised
    /// after that, so callers drop the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Cut the next complete frame off the buffer, if there is one.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => match self.take_header()? {
                Some(header) => header,
                None => return Ok(None),
            },
        };

        if self.buffer.len() < header.body_length() {
            self.pending = Some(header);
            return Ok(None);
        }

        let name = self.buffer.split_to(usize::from(header.name_length)).freeze();
        let payload = self.buffer.split_to(header.payload_length as usize).freeze();
        Ok(Some(Frame::new(header, name, payload)))
    }

    fn take_header(&mut self) -> Result<Option<Header>> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = Header::decode(&self.buffer[..HEADER_SIZE])
            .ok_or_else(|| ShipperError::Protocol("incomplete frame header".to_string()))?;
        header.validate(self.max_payload_size)?;

        let _ = self.buffer.split_to(HEADER_SIZE);
        Ok(Some(header))
    }

    /// Buffered bytes not yet returned as frames (excluding a parsed header).
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.pending.is_none()
    }

    /// True while a header has been read and its body is incomplete.
    pub fn is_mid_frame(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop buffered bytes and any partially read frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending = None;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_request, build_response, flags};

    fn open_call(request_id: u32) -> Vec<u8> {
        build_request("bla_open", request_id, b"\x00\x00\x00\x04/tmp").unwrap()
    }

    #[test]
    fn test_request_and_response_back_to_back() {
        let mut wire = open_call(1);
        wire.extend(build_response(flags::ERROR_RESPONSE, 1, b"nope").unwrap());
        wire.extend(open_call(2));

        let frames = FrameBuffer::new().push(&wire).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].procedure().unwrap(), "bla_open");
        assert!(frames[1].is_error() && frames[1].name.is_empty());
        assert_eq!(frames[2].request_id(), 2);
    }

    #[test]
    fn test_every_split_point() {
        let wire = open_call(9);
        for split in 0..=wire.len() {
            let mut buffer = FrameBuffer::new();
            let mut frames = buffer.push(&wire[..split]).unwrap();
            frames.extend(buffer.push(&wire[split..]).unwrap());

            assert_eq!(frames.len(), 1, "split at {}", split);
            assert_eq!(&frames[0].payload[..], b"\x00\x00\x00\x04/tmp");
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_waits_for_body() {
        let wire = open_call(3);
        let mut buffer = FrameBuffer::new();

        assert!(buffer.push(&wire[..HEADER_SIZE + 2]).unwrap().is_empty());
        assert!(buffer.is_mid_frame());
        assert_eq!(buffer.len(), 2);

        buffer.clear();
        assert!(!buffer.is_mid_frame());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_next_frame_one_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let mut wire = open_call(1);
        wire.extend(open_call(2));
        buffer.buffer.extend_from_slice(&wire);

        assert_eq!(buffer.next_frame().unwrap().unwrap().request_id(), 1);
        assert_eq!(buffer.next_frame().unwrap().unwrap().request_id(), 2);
        assert!(buffer.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_payload_is_a_view_of_the_read_buffer() {
        let payload = vec![0x5A; 256 * 1024];
        let wire = build_request("write", 4, &payload).unwrap();

        let frames = FrameBuffer::new().push(&wire).unwrap();
        assert_eq!(frames[0].payload_len(), payload.len());
        assert_eq!(frames[0].header.name_length, 5);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut buffer = FrameBuffer::with_max_payload(16);
        let header = Header::new(3, flags::REQUEST, 1, 17);

        let err = buffer.push(&header.encode()).unwrap_err();
        assert!(matches!(err, ShipperError::Protocol(_)));
    }

    #[test]
    fn test_nameless_request_rejected() {
        let header = Header::new(0, flags::REQUEST, 1, 0);
        assert!(FrameBuffer::new().push(&header.encode()).is_err());
    }
}
