//! # EntiLink Codec
//!
//! Typed values and the primitive value codec for EntiLink.
//!
//! This crate provides:
//! - [`Value`], the in-memory form of a structural property
//! - [`TypeDescriptor`] and [`PrimitiveKind`], with resolution of metadata
//!   type expressions such as `Collection(Edm.Int32)`
//! - [`PrimitiveCodec`], the encode/decode capability consumed by the
//!   change-tracking core, and [`JsonCodec`], its OData JSON implementation
//!
//! ## Usage
//!
//! ```
//! use entilink_codec::{JsonCodec, PrimitiveCodec, PrimitiveKind, TypeDescriptor, Value};
//!
//! let codec = JsonCodec;
//! let ty = TypeDescriptor::Primitive(PrimitiveKind::Int32);
//! let wire = codec.encode(&Value::Integer(42), &ty).unwrap();
//! assert_eq!(codec.decode(&wire, &ty).unwrap(), Value::Integer(42));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod kind;
mod value;

pub use decoder::decode_value;
pub use encoder::encode_value;
pub use error::{CodecError, CodecResult};
pub use kind::{ComplexType, PrimitiveKind, TypeDescriptor};
pub use value::Value;

/// Encodes and decodes individual property values.
///
/// Implementations must be pure: the same input always yields the same
/// output, so that unchanged values are never mistaken for edits.
pub trait PrimitiveCodec: Send + Sync {
    /// Encodes a local value to its wire form.
    fn encode(&self, value: &Value, ty: &TypeDescriptor) -> CodecResult<serde_json::Value>;

    /// Decodes a wire value to its local form.
    fn decode(&self, wire: &serde_json::Value, ty: &TypeDescriptor) -> CodecResult<Value>;
}

/// OData JSON primitive codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PrimitiveCodec for JsonCodec {
    fn encode(&self, value: &Value, ty: &TypeDescriptor) -> CodecResult<serde_json::Value> {
        encode_value(value, ty)
    }

    fn decode(&self, wire: &serde_json::Value, ty: &TypeDescriptor) -> CodecResult<Value> {
        decode_value(wire, ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn codec_decodes_what_it_encodes() {
        let codec = JsonCodec;
        let ty = TypeDescriptor::parse("Collection(Edm.Guid)").unwrap();
        let value = Value::Collection(vec![Value::Guid(uuid::Uuid::nil())]);
        let wire = codec.encode(&value, &ty).unwrap();
        assert_eq!(wire, json!(["00000000-0000-0000-0000-000000000000"]));
        assert_eq!(codec.decode(&wire, &ty).unwrap(), value);
    }

    proptest! {
        #[test]
        fn int32_rejects_everything_outside_its_range(n in any::<i64>()) {
            let ty = TypeDescriptor::Primitive(PrimitiveKind::Int32);
            let fits = i32::try_from(n).is_ok();
            prop_assert_eq!(JsonCodec.encode(&Value::Integer(n), &ty).is_ok(), fits);
        }

        #[test]
        fn strings_are_passed_through(s in ".*") {
            let ty = TypeDescriptor::Primitive(PrimitiveKind::String);
            let wire = JsonCodec.encode(&Value::Text(s.clone()), &ty).unwrap();
            prop_assert_eq!(wire, serde_json::Value::String(s));
        }
    }
}
