//! Value to wire (JSON) encoder.

use crate::error::{CodecError, CodecResult};
use crate::kind::{ComplexType, PrimitiveKind, TypeDescriptor};
use crate::value::Value;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{Map, Number, Value as Json};
use uuid::Uuid;

/// Encodes a value to its JSON wire form according to `ty`.
///
/// `Value::Null` encodes to JSON `null` regardless of the declared type;
/// nullability is enforced by the caller, which knows the property facets.
///
/// # Errors
///
/// Returns an error if the value does not fit the declared type.
pub fn encode_value(value: &Value, ty: &TypeDescriptor) -> CodecResult<Json> {
    if value.is_null() {
        return Ok(Json::Null);
    }
    match ty {
        TypeDescriptor::Primitive(kind) => encode_primitive(value, *kind),
        TypeDescriptor::Complex(complex) => encode_complex(value, complex),
        TypeDescriptor::Collection(element) => {
            let items = value
                .as_collection()
                .ok_or_else(|| CodecError::type_mismatch(ty.expression(), value.variant_name()))?;
            items
                .iter()
                .map(|item| encode_value(item, element))
                .collect::<CodecResult<Vec<_>>>()
                .map(Json::Array)
        }
    }
}

fn encode_complex(value: &Value, complex: &ComplexType) -> CodecResult<Json> {
    let Value::Complex(fields) = value else {
        return Err(CodecError::type_mismatch(&complex.name, value.variant_name()));
    };
    let mut out = Map::new();
    for (name, field_value) in fields {
        let field_ty = complex
            .fields
            .get(name)
            .ok_or_else(|| CodecError::UnknownField {
                type_name: complex.name.clone(),
                field: name.clone(),
            })?;
        out.insert(name.clone(), encode_value(field_value, field_ty)?);
    }
    Ok(Json::Object(out))
}

fn encode_primitive(value: &Value, kind: PrimitiveKind) -> CodecResult<Json> {
    let mismatch = || CodecError::type_mismatch(kind.edm_name(), value.variant_name());

    match kind {
        PrimitiveKind::Boolean => value.as_bool().map(Json::Bool).ok_or_else(mismatch),
        PrimitiveKind::Byte
        | PrimitiveKind::SByte
        | PrimitiveKind::Int16
        | PrimitiveKind::Int32
        | PrimitiveKind::Int64 => {
            let n = value.as_integer().ok_or_else(mismatch)?;
            check_integral_range(n, kind)?;
            Ok(Json::Number(Number::from(n)))
        }
        PrimitiveKind::Single | PrimitiveKind::Double => {
            let d = value.as_double().ok_or_else(mismatch)?;
            Ok(encode_double(d))
        }
        PrimitiveKind::Decimal => match value {
            Value::Integer(n) => Ok(Json::Number(Number::from(*n))),
            Value::Double(d) => Number::from_f64(*d)
                .map(Json::Number)
                .ok_or_else(|| CodecError::out_of_range(kind.edm_name(), d)),
            Value::Text(s) => {
                let parsed: f64 = s
                    .parse()
                    .map_err(|_| CodecError::invalid_literal(kind.edm_name(), s.clone()))?;
                Number::from_f64(parsed)
                    .map(Json::Number)
                    .ok_or_else(|| CodecError::out_of_range(kind.edm_name(), s))
            }
            _ => Err(mismatch()),
        },
        PrimitiveKind::Binary => value
            .as_bytes()
            .map(|b| Json::String(STANDARD.encode(b)))
            .ok_or_else(mismatch),
        PrimitiveKind::Guid => match value {
            Value::Guid(g) => Ok(Json::String(g.hyphenated().to_string())),
            Value::Text(s) => Uuid::parse_str(s)
                .map(|g| Json::String(g.hyphenated().to_string()))
                .map_err(|e| CodecError::invalid_literal(kind.edm_name(), e.to_string())),
            _ => Err(mismatch()),
        },
        _ if kind.is_textual() => value
            .as_text()
            .map(|s| Json::String(s.to_string()))
            .ok_or_else(mismatch),
        _ => Err(mismatch()),
    }
}

pub(crate) fn check_integral_range(n: i64, kind: PrimitiveKind) -> CodecResult<()> {
    match kind.integral_range() {
        Some((min, max)) if n < min || n > max => Err(CodecError::out_of_range(kind.edm_name(), n)),
        _ => Ok(()),
    }
}

/// Non-finite doubles have no JSON number form and travel as text.
fn encode_double(d: f64) -> Json {
    if d.is_nan() {
        Json::String("NaN".into())
    } else if d.is_infinite() {
        Json::String(if d > 0.0 { "INF" } else { "-INF" }.into())
    } else {
        Number::from_f64(d).map_or(Json::Null, Json::Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prim(kind: PrimitiveKind) -> TypeDescriptor {
        TypeDescriptor::Primitive(kind)
    }

    #[test]
    fn integers_respect_range() {
        assert_eq!(
            encode_value(&Value::Integer(255), &prim(PrimitiveKind::Byte)).unwrap(),
            json!(255)
        );
        let err = encode_value(&Value::Integer(256), &prim(PrimitiveKind::Byte)).unwrap_err();
        assert!(matches!(err, CodecError::OutOfRange { .. }));
    }

    #[test]
    fn binary_is_base64() {
        let encoded =
            encode_value(&Value::Bytes(b"hello".to_vec()), &prim(PrimitiveKind::Binary)).unwrap();
        assert_eq!(encoded, json!("aGVsbG8="));
    }

    #[test]
    fn non_finite_doubles_become_text() {
        let ty = prim(PrimitiveKind::Double);
        assert_eq!(encode_value(&Value::Double(f64::NAN), &ty).unwrap(), json!("NaN"));
        assert_eq!(
            encode_value(&Value::Double(f64::NEG_INFINITY), &ty).unwrap(),
            json!("-INF")
        );
    }

    #[test]
    fn text_for_integer_is_mismatch() {
        let err = encode_value(&Value::from("12"), &prim(PrimitiveKind::Int32)).unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { .. }));
    }

    #[test]
    fn complex_rejects_unknown_field() {
        let address = ComplexType::new("Sales.Address").field("City", prim(PrimitiveKind::String));
        let ty = TypeDescriptor::Complex(address);

        let ok = Value::complex([("City", Value::from("Oslo"))]);
        assert_eq!(encode_value(&ok, &ty).unwrap(), json!({"City": "Oslo"}));

        let bad = Value::complex([("Planet", Value::from("Earth"))]);
        assert!(matches!(
            encode_value(&bad, &ty).unwrap_err(),
            CodecError::UnknownField { .. }
        ));
    }

    #[test]
    fn null_encodes_for_any_type() {
        assert_eq!(
            encode_value(&Value::Null, &prim(PrimitiveKind::Guid)).unwrap(),
            Json::Null
        );
    }
}
