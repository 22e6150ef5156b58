//! JSON text <-> structured values. Object key order is preserved end to end
//! (serde_json `preserve_order`), so payloads come back the way writers sent them.

use serde_json::{Map, Value};

pub type Object = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Syntax(#[from] serde_json::Error),

    #[error("expected a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Compact,
    Pretty,
}

pub fn decode(text: &[u8]) -> Result<Value, CodecError> {
    Ok(serde_json::from_slice(text)?)
}

pub fn decode_object(text: &[u8]) -> Result<Object, CodecError> {
    match decode(text)? {
        Value::Object(map) => Ok(map),
        _ => Err(CodecError::NotAnObject),
    }
}

pub fn encode(value: &Value, style: Style) -> Result<String, CodecError> {
    let text = match style {
        Style::Compact => serde_json::to_string(value)?,
        Style::Pretty => serde_json::to_string_pretty(value)?,
    };
    Ok(text)
}
