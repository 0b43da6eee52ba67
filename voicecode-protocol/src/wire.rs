//! Bidirectional conversion between wire-format snake_case keys and the
//! kebab-like symbolic names used internally for dynamically-shaped JSON
//! (recipe outcome tokens, free-form usage/cost blobs, config overrides).
//!
//! Fixed-shape messages (see [`crate::messages`]) round-trip through serde's
//! `rename_all = "snake_case"` directly and never need this module; it exists
//! for the payloads whose keys are not known ahead of time.

use serde_json::Map;
use serde_json::Value;

/// `some_key` -> `some-key`.
pub fn wire_key_to_internal(key: &str) -> String {
    key.replace('_', "-")
}

/// `some-key` -> `some_key`.
pub fn internal_key_to_wire(key: &str) -> String {
    key.replace('-', "_")
}

/// Recursively rewrite every object key in `value` from wire (snake_case) to
/// internal (kebab-like) form. Arrays and scalars are left untouched.
pub fn value_to_internal(value: &Value) -> Value {
    rewrite_keys(value, wire_key_to_internal)
}

/// Recursively rewrite every object key in `value` from internal form back
/// to wire (snake_case) form.
pub fn value_to_wire(value: &Value) -> Value {
    rewrite_keys(value, internal_key_to_wire)
}

fn rewrite_keys(value: &Value, convert: fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(convert(k), rewrite_keys(v, convert));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| rewrite_keys(v, convert)).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    #[test]
    fn key_conversion_round_trips_on_alphanumeric_underscore_identifiers() {
        for key in ["session_id", "working_directory", "a", "a1_b2", "already"] {
            let internal = wire_key_to_internal(key);
            assert_eq!(internal_key_to_wire(&internal), key);
        }
    }

    #[test]
    fn value_round_trips_through_internal_and_back() {
        let original = json!({
            "session_id": "abc",
            "usage": {"input_tokens": 10, "output_tokens": 20},
            "tags": ["a_b", "c_d"],
        });
        let internal = value_to_internal(&original);
        assert_eq!(internal["session-id"], "abc");
        assert_eq!(internal["usage"]["input-tokens"], 10);
        let back = value_to_wire(&internal);
        assert_eq!(back, original);
    }
}
