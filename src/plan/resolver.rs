//! Variable resolution for step arguments.
//!
//! A reference is either a string `"$ref:<key>"` or a single-key object
//! `{"$ref": "<key>"}`. References are replaced by the value stored under
//! `<key>` in the run's [`OutputBag`]; everything else is returned unchanged.
//! Resolution is pure: the bag is only read.

use serde_json::{Map, Value};

use crate::error::ExecutionError;
use crate::plan::OutputBag;

/// Prefix marking a string argument as a reference into the output bag.
pub const REF_PREFIX: &str = "$ref:";

/// Key of the object form of a reference.
pub const REF_OBJECT_KEY: &str = "$ref";

/// Return the referenced key if `value` is a reference.
fn reference_key(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => s.strip_prefix(REF_PREFIX),
        Value::Object(map) if map.len() == 1 => map.get(REF_OBJECT_KEY).and_then(Value::as_str),
        _ => None,
    }
}

/// Recursively resolve every reference inside `value`.
pub fn resolve(value: &Value, bag: &OutputBag) -> Result<Value, ExecutionError> {
    if let Some(key) = reference_key(value) {
        return bag
            .get(key)
            .cloned()
            .ok_or_else(|| ExecutionError::UnresolvedReference {
                key: key.to_string(),
            });
    }

    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, bag))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_args(map, bag).map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Resolve a step's argument mapping, preserving keys and their order.
pub fn resolve_args(
    args: &Map<String, Value>,
    bag: &OutputBag,
) -> Result<Map<String, Value>, ExecutionError> {
    let mut out = Map::with_capacity(args.len());
    for (key, value) in args {
        out.insert(key.clone(), resolve(value, bag)?);
    }
    Ok(out)
}
