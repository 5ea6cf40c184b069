//! Safe-string codec for declared columns.
//!
//! Columns listed in a type's `safe_str_columns` are stored encoded so that
//! arbitrary user text can participate in composite identifiers: the
//! URL-safe base64 alphabet contains neither the `/` identifier separator
//! nor anything the cache key namespace treats specially. Values are
//! decoded again after every fetch, before results reach the caller.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

/// Encode a string column value for storage.
pub fn encode(raw: &str) -> String {
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

/// Decode a stored column value. Returns the input unchanged when it is not
/// valid encoded text, so legacy plain rows survive a read.
pub fn decode(stored: &str) -> String {
    match URL_SAFE_NO_PAD.decode(stored.as_bytes()) {
        Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| stored.to_string()),
        Err(_) => stored.to_string(),
    }
}

/// Encode a JSON value in place when it is a string; other kinds pass
/// through untouched.
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(encode(s)),
        other => other.clone(),
    }
}

/// Decode a JSON value in place when it is a string.
pub fn decode_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(decode(s)),
        other => other.clone(),
    }
}
