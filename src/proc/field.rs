//! Field marshalling routines.
//!
//! Every type that crosses the wire implements [`ProcField`] with one method
//! that branches on the Proc's mode. Structures compose their fields with
//! [`proc_struct!`](crate::proc_struct), which visits them in declaration
//! order for all three modes.
//!
//! Wire rules:
//! - integers and floats: big endian, fixed width
//! - `bool`: one byte, 0 or 1
//! - `String`, `Vec<u8>`, `Bytes`: u32 BE length prefix + bytes
//! - `[u8; N]`: N raw bytes
//! - `Option<T>`: presence byte, then `T` when present
//! - `Seq<T>`: u32 BE count, then each element

use bytes::Bytes;

use super::{ExtraBuffer, OutputBuffer, Proc, ProcMode};
use crate::error::{Result, ShipperError};

/// A value that can be decoded, encoded and freed by a [`Proc`].
pub trait ProcField {
    /// Run this field through the Proc in its current mode.
    fn process(&mut self, proc: &mut Proc) -> Result<()>;
}

macro_rules! impl_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ProcField for $ty {
                fn process(&mut self, proc: &mut Proc) -> Result<()> {
                    match proc.mode() {
                        ProcMode::Encode => proc.write_bytes(&self.to_be_bytes()),
                        ProcMode::Decode => {
                            let bytes = proc.read_array::<{ std::mem::size_of::<$ty>() }>()?;
                            *self = <$ty>::from_be_bytes(bytes);
                            Ok(())
                        }
                        ProcMode::Free => Ok(()),
                    }
                }
            }
        )*
    };
}

impl_scalar!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// Empty argument or result; nothing on the wire.
impl ProcField for () {
    fn process(&mut self, _proc: &mut Proc) -> Result<()> {
        Ok(())
    }
}

impl ProcField for bool {
    fn process(&mut self, proc: &mut Proc) -> Result<()> {
        match proc.mode() {
            ProcMode::Encode => proc.write_bytes(&[u8::from(*self)]),
            ProcMode::Decode => {
                let [byte] = proc.read_array::<1>()?;
                *self = match byte {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(ShipperError::Malformed(format!(
                            "invalid bool byte {:#04x}",
                            other
                        )))
                    }
                };
                Ok(())
            }
            ProcMode::Free => Ok(()),
        }
    }
}

impl ProcField for String {
    fn process(&mut self, proc: &mut Proc) -> Result<()> {
        match proc.mode() {
            ProcMode::Encode => proc.write_blob(self.as_bytes()),
            ProcMode::Decode => {
                let bytes = proc.read_blob()?;
                *self = String::from_utf8(bytes.to_vec())
                    .map_err(|e| ShipperError::Malformed(format!("invalid UTF-8 string: {}", e)))?;
                Ok(())
            }
            ProcMode::Free => {
                *self = String::new();
                Ok(())
            }
        }
    }
}

/// Owned blob, copied out of the input on decode.
impl ProcField for Vec<u8> {
    fn process(&mut self, proc: &mut Proc) -> Result<()> {
        match proc.mode() {
            ProcMode::Encode => proc.write_blob(self),
            ProcMode::Decode => {
                *self = proc.read_blob()?.to_vec();
                Ok(())
            }
            ProcMode::Free => {
                *self = Vec::new();
                Ok(())
            }
        }
    }
}

/// Zero-copy blob: decode points into the input buffer.
impl ProcField for Bytes {
    fn process(&mut self, proc: &mut Proc) -> Result<()> {
        match proc.mode() {
            ProcMode::Encode => proc.write_blob(self),
            ProcMode::Decode => {
                *self = proc.read_blob()?;
                Ok(())
            }
            ProcMode::Free => {
                *self = Bytes::new();
                Ok(())
            }
        }
    }
}

/// Fixed-size opaque structure.
impl<const N: usize> ProcField for [u8; N] {
    fn process(&mut self, proc: &mut Proc) -> Result<()> {
        match proc.mode() {
            ProcMode::Encode => proc.write_bytes(self),
            ProcMode::Decode => {
                *self = proc.read_array::<N>()?;
                Ok(())
            }
            ProcMode::Free => Ok(()),
        }
    }
}

impl<T: ProcField + Default> ProcField for Option<T> {
    fn process(&mut self, proc: &mut Proc) -> Result<()> {
        match proc.mode() {
            ProcMode::Encode => match self {
                Some(value) => {
                    proc.write_bytes(&[1])?;
                    value.process(proc)
                }
                None => proc.write_bytes(&[0]),
            },
            ProcMode::Decode => {
                let mut present = false;
                present.process(proc)?;
                if present {
                    let mut value = T::default();
                    value.process(proc)?;
                    *self = Some(value);
                } else {
                    *self = None;
                }
                Ok(())
            }
            ProcMode::Free => {
                if let Some(mut value) = self.take() {
                    value.process(proc)?;
                }
                Ok(())
            }
        }
    }
}

/// Sequence of fields: u32 BE element count, then each element.
///
/// A newtype rather than `Vec<T>` so `Vec<u8>` can stay a plain blob.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Seq<T>(pub Vec<T>);

impl<T: ProcField + Default> ProcField for Seq<T> {
    fn process(&mut self, proc: &mut Proc) -> Result<()> {
        match proc.mode() {
            ProcMode::Encode => {
                let count = u32::try_from(self.0.len()).map_err(|_| {
                    ShipperError::InvalidArgument(format!(
                        "sequence of {} elements is too long",
                        self.0.len()
                    ))
                })?;
                proc.write_bytes(&count.to_be_bytes())?;
                for item in &mut self.0 {
                    item.process(proc)?;
                }
                Ok(())
            }
            ProcMode::Decode => {
                let count = u32::from_be_bytes(proc.read_array::<4>()?) as usize;
                // the count is peer-supplied: reserve no more memory than input remains
                let fits = proc.remaining() / std::mem::size_of::<T>().max(1);
                let mut items = Vec::with_capacity(count.min(fits));
                for _ in 0..count {
                    let mut item = T::default();
                    let result = item.process(proc);
                    items.push(item);
                    if let Err(e) = result {
                        // keep partial elements reachable for the free pass
                        self.0 = items;
                        return Err(e);
                    }
                }
                self.0 = items;
                Ok(())
            }
            ProcMode::Free => {
                for item in &mut self.0 {
                    item.process(proc)?;
                }
                self.0.clear();
                Ok(())
            }
        }
    }
}

/// Implement [`ProcField`] for a struct by processing the listed fields in
/// order.
///
/// ```
/// use function_shipper::proc::{decode_value, encode_value, OutputBuffer};
/// use function_shipper::proc_struct;
///
/// #[derive(Debug, Default, PartialEq)]
/// struct Point {
///     x: i32,
///     y: i32,
/// }
/// proc_struct!(Point { x, y });
///
/// let mut p = Point { x: 3, y: -4 };
/// let encoded = encode_value(&mut p, OutputBuffer::with_capacity(16)).unwrap();
/// let (wire, _) = encoded.into_payload();
/// assert_eq!(decode_value::<Point>(wire).unwrap(), p);
/// ```
#[macro_export]
macro_rules! proc_struct {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl $crate::proc::ProcField for $ty {
            fn process(
                &mut self,
                proc: &mut $crate::proc::Proc,
            ) -> $crate::error::Result<()> {
                $( $crate::proc::ProcField::process(&mut self.$field, proc)?; )*
                Ok(())
            }
        }
    };
}

/// Result of a complete encode pass.
#[derive(Debug)]
pub struct Encoded {
    /// Inline buffer (holds the whole payload unless it spilled).
    pub output: OutputBuffer,
    /// Spill-over buffer holding the whole payload, if the inline one was
    /// too small.
    pub extra: Option<ExtraBuffer>,
}

impl Encoded {
    #[inline]
    pub fn has_extra(&self) -> bool {
        self.extra.is_some()
    }

    /// Total encoded length.
    pub fn len(&self) -> usize {
        match &self.extra {
            Some(extra) => extra.len(),
            None => self.output.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The bytes to transmit, and whether they came from an extra buffer.
    pub fn into_payload(self) -> (Bytes, bool) {
        match self.extra {
            Some(extra) => (extra.into_bytes(), true),
            None => (self.output.freeze(), false),
        }
    }
}

/// Decode a value from received bytes.
///
/// Allocations made before a failure are released with a free pass.
pub fn decode_value<T: ProcField + Default>(input: Bytes) -> Result<T> {
    let mut value = T::default();
    let mut proc = Proc::decode(input);
    if let Err(e) = value.process(&mut proc) {
        release_value(&mut value)?;
        return Err(e);
    }
    proc.close();
    Ok(value)
}

/// Encode a value into `output`, spilling if needed.
pub fn encode_value<T: ProcField>(value: &mut T, output: OutputBuffer) -> Result<Encoded> {
    encode_with(value, Proc::encode(output))
}

/// Encode through a preconfigured encoding Proc.
pub(crate) fn encode_with<T: ProcField>(value: &mut T, mut proc: Proc) -> Result<Encoded> {
    value.process(&mut proc)?;
    let extra = proc.take_extra_buffer();
    let output = proc.into_output()?;
    Ok(Encoded { output, extra })
}

/// Run a free pass over a decoded value.
pub fn release_value<T: ProcField>(value: &mut T) -> Result<()> {
    let mut proc = Proc::free();
    value.process(&mut proc)?;
    proc.close();
    Ok(())
}
