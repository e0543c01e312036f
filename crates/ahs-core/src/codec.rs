//! Serialization helpers.
//!
//! CBOR is used for records at rest (key store); JSON for everything that
//! crosses the WebSocket.

use std::io::Cursor;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{AhsError, AhsResult};

/// Encode a value as CBOR.
pub fn cbor_encode<T: Serialize>(value: &T) -> AhsResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out)?;
    Ok(out)
}

/// Decode a CBOR value.
pub fn cbor_decode<T: DeserializeOwned>(data: &[u8]) -> AhsResult<T> {
    let value: T = ciborium::from_reader(Cursor::new(data))?;
    Ok(value)
}

/// Parse a text frame that must be a JSON object.
pub fn parse_json_object(text: &str) -> AhsResult<serde_json::Map<String, Value>> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        other => Err(AhsError::InvalidMessage(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

/// Encode a value as a JSON text frame.
pub fn json_text<T: Serialize>(value: &T) -> AhsResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
