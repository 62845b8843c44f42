//! Masking of credential-like fields before anything is persisted.
//!
//! Run records and audit entries carry resolved step arguments, which may
//! include API keys or bearer tokens handed to `http.fetch`. Every value whose
//! key looks sensitive is replaced with [`REDACTED`], at any depth.

use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";

/// Keys masked only on an exact (case-insensitive) match.
const SENSITIVE_EXACT: &[&str] = &["key", "auth", "cookie", "set-cookie", "x-api-key"];

/// Keys masked when they contain any of these fragments.
const SENSITIVE_FRAGMENTS: &[&str] = &[
    "token",
    "secret",
    "password",
    "passwd",
    "credential",
    "authorization",
    "api_key",
    "api-key",
    "apikey",
    "private_key",
    "signature",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_EXACT.contains(&lower.as_str())
        || SENSITIVE_FRAGMENTS.iter().any(|f| lower.contains(f))
}

fn redact_in_place(value: &mut Value) {
    match value {
        Value::Object(map) => redact_object(map),
        Value::Array(items) => items.iter_mut().for_each(redact_in_place),
        _ => {}
    }
}

fn redact_object(map: &mut Map<String, Value>) {
    for (key, val) in map.iter_mut() {
        if is_sensitive_key(key) {
            *val = Value::String(REDACTED.to_string());
        } else {
            redact_in_place(val);
        }
    }
}

/// Return a copy of `value` with sensitive fields masked.
pub fn redact_sensitive_json(value: &Value) -> Value {
    let mut cloned = value.clone();
    redact_in_place(&mut cloned);
    cloned
}

/// Serialize and mask in one go.
pub fn redacted<T: serde::Serialize>(value: &T) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(value)?;
    redact_in_place(&mut value);
    Ok(value)
}
