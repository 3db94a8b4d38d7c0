//! Small helpers for working with `ciborium` values.
//!
//! FDO messages are positional CBOR arrays, so the codec layer works on
//! [`Value`] trees directly rather than derived (de)serialization.

use ciborium::value::Value;

use crate::error::ProtocolError;

/// Serialize a CBOR value to bytes.
pub fn to_vec(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| ProtocolError::Malformed {
        context: "CBOR encoding",
        reason: e.to_string(),
    })?;
    Ok(buf)
}

/// Deserialize bytes into a CBOR value.
pub fn from_slice(bytes: &[u8]) -> Result<Value, ProtocolError> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Malformed {
        context: "CBOR decoding",
        reason: e.to_string(),
    })
}

fn malformed(context: &'static str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::Malformed {
        context,
        reason: reason.into(),
    }
}

/// Unwrap an array value, checking nothing about its length.
pub fn array(value: Value, context: &'static str) -> Result<Vec<Value>, ProtocolError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(malformed(context, format!("expected array, got {other:?}"))),
    }
}

/// Unwrap an array value of exactly `len` elements.
pub fn array_of(value: Value, len: usize, context: &'static str) -> Result<Vec<Value>, ProtocolError> {
    let items = array(value, context)?;
    if items.len() != len {
        return Err(malformed(
            context,
            format!("expected array of {len} elements, got {}", items.len()),
        ));
    }
    Ok(items)
}

pub fn bytes(value: Value, field: &'static str) -> Result<Vec<u8>, ProtocolError> {
    match value {
        Value::Bytes(b) => Ok(b),
        _ => Err(malformed(field, "expected byte string")),
    }
}

pub fn text(value: Value, field: &'static str) -> Result<String, ProtocolError> {
    match value {
        Value::Text(s) => Ok(s),
        _ => Err(malformed(field, "expected text string")),
    }
}

pub fn uint(value: &Value, field: &'static str) -> Result<u64, ProtocolError> {
    match value {
        Value::Integer(i) => {
            let v: i128 = (*i).into();
            u64::try_from(v).map_err(|_| malformed(field, "expected unsigned integer"))
        }
        _ => Err(malformed(field, "expected integer")),
    }
}

pub fn int(value: &Value, field: &'static str) -> Result<i64, ProtocolError> {
    match value {
        Value::Integer(i) => {
            let v: i128 = (*i).into();
            i64::try_from(v).map_err(|_| malformed(field, "integer out of range"))
        }
        _ => Err(malformed(field, "expected integer")),
    }
}

pub fn boolean(value: &Value, field: &'static str) -> Result<bool, ProtocolError> {
    match value {
        Value::Bool(b) => Ok(*b),
        _ => Err(malformed(field, "expected boolean")),
    }
}

/// A fixed-length byte string, e.g. a GUID or nonce.
pub fn fixed_bytes<const N: usize>(value: Value, field: &'static str) -> Result<[u8; N], ProtocolError> {
    let b = bytes(value, field)?;
    <[u8; N]>::try_from(b.as_slice())
        .map_err(|_| malformed(field, format!("expected {N}-byte string")))
}
