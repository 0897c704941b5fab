//! Proc engine - the serialization cursor used by every marshalling routine.
//!
//! A [`Proc`] wraps one byte region and a mode:
//!
//! - [`ProcMode::Decode`] reads fields out of an input buffer (zero-copy for
//!   `Bytes` fields)
//! - [`ProcMode::Encode`] writes fields into an [`OutputBuffer`], spilling once
//!   into an [`ExtraBuffer`] when the inline capacity runs out
//! - [`ProcMode::Free`] performs no I/O and releases what a decode allocated
//!
//! Type-specific routines implement [`ProcField`] once and branch on
//! [`Proc::mode`], so the three passes always visit fields in the same order.
//!
//! # Example
//!
//! ```
//! use function_shipper::proc::{OutputBuffer, Proc, ProcField};
//!
//! let mut path = String::from("/tmp/x");
//! let mut proc = Proc::encode(OutputBuffer::with_capacity(64));
//! path.process(&mut proc).unwrap();
//! let wire = proc.into_output().unwrap().freeze();
//!
//! let mut decoded = String::new();
//! let mut proc = Proc::decode(wire);
//! decoded.process(&mut proc).unwrap();
//! assert_eq!(decoded, "/tmp/x");
//! ```

mod buffer;
mod field;
mod msgpack;

pub use buffer::{ExtraBuffer, OutputBuffer};
pub(crate) use field::encode_with;
pub use field::{decode_value, encode_value, release_value, Encoded, ProcField, Seq};
pub use msgpack::MsgPack;

use bytes::Bytes;

use crate::error::{Result, ShipperError};

/// Default cap on how large an extra buffer may grow (1 GB).
pub const DEFAULT_MAX_EXTRA_SIZE: usize = 1_073_741_824;

/// Direction of a Proc pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcMode {
    /// Read values out of the buffer.
    Decode,
    /// Write values into the buffer.
    Encode,
    /// Release allocations made by a previous decode.
    Free,
}

/// Byte region behind a Proc.
#[derive(Debug)]
enum Region {
    Input(Bytes),
    Output(OutputBuffer),
    None,
}

/// Serialization cursor over a byte region.
#[derive(Debug)]
pub struct Proc {
    mode: ProcMode,
    region: Region,
    /// Bytes consumed (decode) or produced (encode) so far.
    offset: usize,
    /// Spill-over buffer; `None` before a spill or after hand-off.
    extra: Option<ExtraBuffer>,
    /// Set once the spill happened, even if the buffer was later taken.
    spilled: bool,
    spill_enabled: bool,
    max_extra: usize,
}

impl Proc {
    fn with_region(mode: ProcMode, region: Region) -> Self {
        Self {
            mode,
            region,
            offset: 0,
            extra: None,
            spilled: false,
            spill_enabled: true,
            max_extra: DEFAULT_MAX_EXTRA_SIZE,
        }
    }

    /// Open a decoding Proc over received bytes.
    pub fn decode(input: Bytes) -> Self {
        Self::with_region(ProcMode::Decode, Region::Input(input))
    }

    /// Open an encoding Proc over an inline output buffer.
    ///
    /// Any bytes already in `output` are discarded.
    pub fn encode(mut output: OutputBuffer) -> Self {
        output.clear();
        Self::with_region(ProcMode::Encode, Region::Output(output))
    }

    /// Open a free-mode Proc. It has no buffer.
    pub fn free() -> Self {
        Self::with_region(ProcMode::Free, Region::None)
    }

    /// Allow or forbid spilling into an extra buffer (encode only).
    pub fn with_spill(mut self, enabled: bool) -> Self {
        self.spill_enabled = enabled;
        self
    }

    /// Cap the total size of the extra buffer.
    pub fn with_max_extra(mut self, max_extra: usize) -> Self {
        self.max_extra = max_extra;
        self
    }

    #[inline]
    pub fn mode(&self) -> ProcMode {
        self.mode
    }

    /// Current offset into the logical payload.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Capacity of the region currently being read or written.
    ///
    /// For an encode that spilled this is the extra buffer's length, which
    /// grows with each write.
    pub fn capacity(&self) -> usize {
        match (&self.region, &self.extra) {
            (_, Some(extra)) => extra.len(),
            (Region::Input(input), None) => input.len(),
            (Region::Output(output), None) => output.capacity(),
            (Region::None, None) => 0,
        }
    }

    /// Bytes left to decode.
    pub fn remaining(&self) -> usize {
        match &self.region {
            Region::Input(input) => input.len() - self.offset,
            _ => 0,
        }
    }

    // ------------------------------------------------------------------
    // Extra buffer ownership
    // ------------------------------------------------------------------

    /// True only while this Proc still owns a spilled extra buffer.
    #[inline]
    pub fn has_extra_buffer(&self) -> bool {
        self.extra.is_some()
    }

    /// Borrow the extra buffer contents, if still owned.
    pub fn extra_buffer(&self) -> Option<&[u8]> {
        self.extra.as_ref().map(ExtraBuffer::as_slice)
    }

    /// Size of the owned extra buffer (0 when none).
    pub fn extra_size(&self) -> usize {
        self.extra.as_ref().map_or(0, ExtraBuffer::len)
    }

    /// Move the extra buffer out. After this the Proc no longer frees it and
    /// a second call returns `None`.
    pub fn take_extra_buffer(&mut self) -> Option<ExtraBuffer> {
        self.extra.take()
    }

    // ------------------------------------------------------------------
    // Raw I/O used by ProcField implementations
    // ------------------------------------------------------------------

    fn expect_mode(&self, mode: ProcMode) -> Result<()> {
        if self.mode != mode {
            return Err(ShipperError::InvalidState(format!(
                "{:?} operation on a {:?} proc",
                mode, self.mode
            )));
        }
        Ok(())
    }

    /// Append encoded bytes, spilling into an extra buffer on overflow.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.expect_mode(ProcMode::Encode)?;
        if data.is_empty() {
            return Ok(());
        }

        if let Some(extra) = self.extra.as_mut() {
            extra.append(data, self.max_extra)?;
            self.offset += data.len();
            return Ok(());
        }

        if self.spilled {
            return Err(ShipperError::InvalidState(
                "extra buffer already handed off".to_string(),
            ));
        }

        let Region::Output(output) = &mut self.region else {
            return Err(ShipperError::InvalidState(
                "encode proc has no output buffer".to_string(),
            ));
        };

        if data.len() <= output.remaining() {
            output.put(data);
            self.offset += data.len();
            return Ok(());
        }

        let needed = self.offset + data.len();
        if !self.spill_enabled {
            if output.capacity() == 0 {
                return Err(ShipperError::InvalidArgument(format!(
                    "cannot encode {} bytes into a zero-capacity buffer without spill",
                    data.len()
                )));
            }
            return Err(ShipperError::Allocation {
                requested: needed,
                limit: output.capacity(),
            });
        }

        let extra = ExtraBuffer::spill(output.as_slice(), data, self.max_extra)?;
        tracing::trace!(
            inline_capacity = output.capacity(),
            size = extra.len(),
            "encode spilled into extra buffer"
        );
        self.extra = Some(extra);
        self.spilled = true;
        self.offset = needed;
        Ok(())
    }

    /// Read exactly `len` bytes as a zero-copy slice of the input.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        self.expect_mode(ProcMode::Decode)?;
        let Region::Input(input) = &self.region else {
            return Err(ShipperError::InvalidState(
                "decode proc has no input buffer".to_string(),
            ));
        };

        let available = input.len() - self.offset;
        if len > available {
            return Err(ShipperError::Truncation {
                needed: len,
                available,
            });
        }

        let out = input.slice(self.offset..self.offset + len);
        self.offset += len;
        Ok(out)
    }

    /// Read a fixed-size array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    /// Write a u32 length prefix followed by the bytes.
    pub fn write_blob(&mut self, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| {
            ShipperError::InvalidArgument(format!(
                "blob of {} bytes exceeds the u32 length prefix",
                data.len()
            ))
        })?;
        self.write_bytes(&len.to_be_bytes())?;
        self.write_bytes(data)
    }

    /// Read a u32 length prefix and the bytes it announces.
    ///
    /// On truncation the offset is restored to the start of the prefix.
    pub fn read_blob(&mut self) -> Result<Bytes> {
        let start = self.offset;
        let len = u32::from_be_bytes(self.read_array::<4>()?) as usize;
        match self.read_bytes(len) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                self.offset = start;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    /// Hand back the inline output buffer (encode mode only).
    ///
    /// An extra buffer that was never taken is released here.
    pub fn into_output(mut self) -> Result<OutputBuffer> {
        self.expect_mode(ProcMode::Encode)?;
        if let Some(extra) = self.extra.take() {
            tracing::debug!(size = extra.len(), "dropping untaken extra buffer");
            extra.release();
        }
        match std::mem::replace(&mut self.region, Region::None) {
            Region::Output(output) => Ok(output),
            _ => Err(ShipperError::InvalidState(
                "encode proc has no output buffer".to_string(),
            )),
        }
    }

    /// Close the Proc, releasing anything it still owns.
    pub fn close(mut self) {
        if let Some(extra) = self.extra.take() {
            extra.release();
        }
    }
}
