//! Wire (JSON) to value decoder.

use crate::encoder::check_integral_range;
use crate::error::{CodecError, CodecResult};
use crate::kind::{ComplexType, PrimitiveKind, TypeDescriptor};
use crate::value::Value;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Decodes a JSON wire value according to `ty`.
///
/// # Errors
///
/// Returns an error if the wire value does not match the declared type.
pub fn decode_value(json: &Json, ty: &TypeDescriptor) -> CodecResult<Value> {
    if json.is_null() {
        return Ok(Value::Null);
    }
    match ty {
        TypeDescriptor::Primitive(kind) => decode_primitive(json, *kind),
        TypeDescriptor::Complex(complex) => decode_complex(json, complex),
        TypeDescriptor::Collection(element) => {
            let items = json
                .as_array()
                .ok_or_else(|| CodecError::type_mismatch(ty.expression(), json_kind(json)))?;
            items
                .iter()
                .map(|item| decode_value(item, element))
                .collect::<CodecResult<Vec<_>>>()
                .map(Value::Collection)
        }
    }
}

fn decode_complex(json: &Json, complex: &ComplexType) -> CodecResult<Value> {
    let object = json
        .as_object()
        .ok_or_else(|| CodecError::type_mismatch(&complex.name, json_kind(json)))?;
    let mut fields = BTreeMap::new();
    for (name, field_json) in object {
        // Annotations such as "@odata.type" are not fields.
        if name.starts_with('@') || name.contains("@odata.") {
            continue;
        }
        let field_ty = complex
            .fields
            .get(name)
            .ok_or_else(|| CodecError::UnknownField {
                type_name: complex.name.clone(),
                field: name.clone(),
            })?;
        fields.insert(name.clone(), decode_value(field_json, field_ty)?);
    }
    Ok(Value::Complex(fields))
}

fn decode_primitive(json: &Json, kind: PrimitiveKind) -> CodecResult<Value> {
    let mismatch = || CodecError::type_mismatch(kind.edm_name(), json_kind(json));

    match kind {
        PrimitiveKind::Boolean => json.as_bool().map(Value::Bool).ok_or_else(mismatch),
        PrimitiveKind::Byte
        | PrimitiveKind::SByte
        | PrimitiveKind::Int16
        | PrimitiveKind::Int32
        | PrimitiveKind::Int64 => {
            let n = match json {
                Json::Number(n) => n.as_i64().ok_or_else(mismatch)?,
                // IEEE754-compatible payloads carry 64-bit integers as text.
                Json::String(s) => s
                    .parse::<i64>()
                    .map_err(|e| CodecError::invalid_literal(kind.edm_name(), e.to_string()))?,
                _ => return Err(mismatch()),
            };
            check_integral_range(n, kind)?;
            Ok(Value::Integer(n))
        }
        PrimitiveKind::Single | PrimitiveKind::Double | PrimitiveKind::Decimal => match json {
            Json::Number(n) => n.as_f64().map(Value::Double).ok_or_else(mismatch),
            Json::String(s) => decode_special_double(s, kind),
            _ => Err(mismatch()),
        },
        PrimitiveKind::Binary => {
            let text = json.as_str().ok_or_else(mismatch)?;
            STANDARD
                .decode(text)
                .map(Value::Bytes)
                .map_err(|e| CodecError::invalid_literal(kind.edm_name(), e.to_string()))
        }
        PrimitiveKind::Guid => {
            let text = json.as_str().ok_or_else(mismatch)?;
            Uuid::parse_str(text)
                .map(Value::Guid)
                .map_err(|e| CodecError::invalid_literal(kind.edm_name(), e.to_string()))
        }
        _ if kind.is_textual() => json
            .as_str()
            .map(|s| Value::Text(s.to_string()))
            .ok_or_else(mismatch),
        _ => Err(mismatch()),
    }
}

fn decode_special_double(text: &str, kind: PrimitiveKind) -> CodecResult<Value> {
    match text {
        "NaN" => Ok(Value::Double(f64::NAN)),
        "INF" => Ok(Value::Double(f64::INFINITY)),
        "-INF" => Ok(Value::Double(f64::NEG_INFINITY)),
        other => other
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|e| CodecError::invalid_literal(kind.edm_name(), e.to_string())),
    }
}

fn json_kind(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}
