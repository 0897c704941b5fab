//! Inline output buffers and spill-over extra buffers.
//!
//! An [`OutputBuffer`] is the fixed-capacity region the transport lends to an
//! encoding [`Proc`](super::Proc). When an encoded payload outgrows it, the
//! Proc spills into an [`ExtraBuffer`], which starts owned by the Proc and
//! moves out exactly once through
//! [`Proc::take_extra_buffer`](super::Proc::take_extra_buffer).

use bytes::{Bytes, BytesMut};

use crate::error::{Result, ShipperError};

/// Fixed-capacity inline buffer an encoding Proc writes into.
#[derive(Debug)]
pub struct OutputBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl OutputBuffer {
    /// Create an empty buffer that accepts at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Declared capacity (not the allocator's rounded-up capacity).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Room left before the declared capacity is reached.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Drop written bytes, keeping the allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Freeze the written bytes for transmission.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    /// Append without a capacity check; callers check `remaining()` first.
    pub(crate) fn put(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.remaining());
        self.buf.extend_from_slice(data);
    }
}

/// Spill-over allocation holding an encoded payload that did not fit inline.
///
/// Owned by exactly one party at a time. The Proc that allocated it hands it
/// off by value; whoever holds it last releases it on drop or through
/// [`ExtraBuffer::release`].
#[derive(Debug)]
pub struct ExtraBuffer {
    data: Vec<u8>,
}

impl ExtraBuffer {
    /// Allocate an extra buffer seeded with the already-encoded inline bytes,
    /// with room for `pending` more bytes.
    pub(crate) fn spill(encoded: &[u8], pending: &[u8], limit: usize) -> Result<Self> {
        let requested = encoded.len() + pending.len();
        if requested > limit {
            return Err(ShipperError::Allocation { requested, limit });
        }

        let mut data = Vec::new();
        data.try_reserve_exact(requested)
            .map_err(|_| ShipperError::Allocation { requested, limit })?;
        data.extend_from_slice(encoded);
        data.extend_from_slice(pending);

        Ok(Self { data })
    }

    /// Append more encoded bytes, growing the allocation if needed.
    pub(crate) fn append(&mut self, bytes: &[u8], limit: usize) -> Result<()> {
        let requested = self.data.len() + bytes.len();
        if requested > limit {
            return Err(ShipperError::Allocation { requested, limit });
        }
        self.data
            .try_reserve(bytes.len())
            .map_err(|_| ShipperError::Allocation { requested, limit })?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Convert into `Bytes` for transmission (no copy).
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.data)
    }

    /// Explicitly release the buffer.
    pub fn release(self) {
        tracing::trace!(size = self.data.len(), "extra buffer released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_buffer_capacity_accounting() {
        let mut out = OutputBuffer::with_capacity(8);
        assert_eq!(out.capacity(), 8);
        assert_eq!(out.remaining(), 8);

        out.put(b"abc");
        assert_eq!(out.len(), 3);
        assert_eq!(out.remaining(), 5);
        assert_eq!(out.as_slice(), b"abc");

        out.clear();
        assert!(out.is_empty());
        assert_eq!(out.capacity(), 8);
    }

    #[test]
    fn test_spill_copies_encoded_prefix() {
        let extra = ExtraBuffer::spill(b"head", b"tail", 1024).unwrap();
        assert_eq!(extra.as_slice(), b"headtail");
        assert_eq!(extra.len(), 8);
    }

    #[test]
    fn test_spill_respects_limit() {
        let err = ExtraBuffer::spill(b"1234", b"5678", 6).unwrap_err();
        assert!(matches!(
            err,
            ShipperError::Allocation {
                requested: 8,
                limit: 6
            }
        ));
    }

    #[test]
    fn test_append_respects_limit() {
        let mut extra = ExtraBuffer::spill(b"", b"abcd", 6).unwrap();
        extra.append(b"ef", 6).unwrap();
        assert!(extra.append(b"g", 6).is_err());
        assert_eq!(extra.as_slice(), b"abcdef");
    }

    #[test]
    fn test_into_bytes_keeps_contents() {
        let extra = ExtraBuffer::spill(b"ab", b"cd", 16).unwrap();
        assert_eq!(&extra.into_bytes()[..], b"abcd");
    }
}
