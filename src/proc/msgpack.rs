//! MessagePack-encoded opaque structures.
//!
//! [`MsgPack<T>`] lets any serde type ride inside a proc structure as a
//! length-prefixed blob. Encoding uses `rmp_serde::to_vec_named` so structs
//! travel as maps (with field names) rather than positional arrays, which
//! keeps them decodable by peers that add or reorder fields.
//!
//! # Example
//!
//! ```
//! use function_shipper::proc::{decode_value, encode_value, MsgPack, OutputBuffer};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
//! struct Attrs {
//!     mode: u32,
//!     owner: String,
//! }
//!
//! let mut attrs = MsgPack(Attrs { mode: 0o644, owner: "root".to_string() });
//! let (wire, _) = encode_value(&mut attrs, OutputBuffer::with_capacity(64))
//!     .unwrap()
//!     .into_payload();
//! let decoded: MsgPack<Attrs> = decode_value(wire).unwrap();
//! assert_eq!(decoded, attrs);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Proc, ProcField, ProcMode};
use crate::error::Result;

/// A serde value carried as a MessagePack blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgPack<T>(pub T);

impl<T> MsgPack<T> {
    /// Unwrap the inner value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> ProcField for MsgPack<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    fn process(&mut self, proc: &mut Proc) -> Result<()> {
        match proc.mode() {
            ProcMode::Encode => {
                // to_vec_named: struct-as-map
                let bytes = rmp_serde::to_vec_named(&self.0)?;
                proc.write_blob(&bytes)
            }
            ProcMode::Decode => {
                let bytes = proc.read_blob()?;
                self.0 = rmp_serde::from_slice(&bytes)?;
                Ok(())
            }
            ProcMode::Free => {
                self.0 = T::default();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShipperError;
    use crate::proc::{decode_value, encode_value, OutputBuffer};
    use bytes::Bytes;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    fn encode<T: Serialize + DeserializeOwned + Default>(value: T) -> Bytes {
        let mut field = MsgPack(value);
        encode_value(&mut field, OutputBuffer::with_capacity(256))
            .unwrap()
            .into_payload()
            .0
    }

    #[test]
    fn test_encode_decode_struct() {
        let wire = encode(TestStruct {
            id: 42,
            name: "test".to_string(),
            active: true,
        });
        let decoded: MsgPack<TestStruct> = decode_value(wire).unwrap();

        assert_eq!(decoded.0.id, 42);
        assert_eq!(decoded.0.name, "test");
        assert!(decoded.0.active);
    }

    #[test]
    fn test_encode_decode_collections() {
        let mut map = HashMap::new();
        map.insert("key1".to_string(), 100);
        map.insert("key2".to_string(), 200);

        let decoded: MsgPack<HashMap<String, i32>> = decode_value(encode(map.clone())).unwrap();
        assert_eq!(decoded.into_inner(), map);
    }

    #[test]
    fn test_struct_is_encoded_as_map() {
        let wire = encode(TestStruct {
            id: 1,
            name: "x".to_string(),
            active: false,
        });

        // 4-byte length prefix, then fixmap with 3 entries (0x83)
        assert_eq!(wire[4], 0x83, "Expected fixmap, got {:02X}", wire[4]);
    }

    #[test]
    fn test_binary_buffer_roundtrip() {
        let data = serde_bytes::ByteBuf::from(vec![1u8, 2, 3, 4, 5]);
        let wire = encode(data.clone());

        // bin8 format marker after the length prefix
        assert_eq!(wire[4], 0xc4);

        let decoded: MsgPack<serde_bytes::ByteBuf> = decode_value(wire).unwrap();
        assert_eq!(decoded.0, data);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let mut wire = 4u32.to_be_bytes().to_vec();
        wire.extend_from_slice(&[0xc1, 0xc1, 0xc1, 0xc1]);

        let result: Result<MsgPack<TestStruct>> = decode_value(Bytes::from(wire));
        assert!(matches!(result, Err(ShipperError::MsgPackDecode(_))));
    }

    #[test]
    fn test_free_resets_to_default() {
        let mut field = MsgPack(TestStruct {
            id: 9,
            name: "gone".to_string(),
            active: true,
        });
        crate::proc::release_value(&mut field).unwrap();
        assert_eq!(field.0, TestStruct::default());
    }
}
