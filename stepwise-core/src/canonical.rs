//! Canonical JSON serialization and digests
//!
//! Object keys are sorted lexicographically at every nesting level so that
//! structurally equal values serialize to identical bytes regardless of the
//! order their keys were inserted in.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Recursively rebuild a value with sorted object keys.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            let mut sorted = Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), canonicalize(v));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serialize a value as canonical JSON text.
pub fn canonical_json(value: &Value) -> String {
    // Writing a `Value` to a string cannot fail: keys are always strings.
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

/// SHA-256 of arbitrary bytes as lowercase hex.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of a value's canonical JSON.
pub fn digest(value: &Value) -> String {
    sha256_hex(canonical_json(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_output() {
        let a: Value =
            serde_json::from_str(r#"{"b": 1, "a": {"y": [ {"q": 1, "p": 2} ], "x": null}}"#)
                .unwrap();
        let b: Value =
            serde_json::from_str(r#"{"a": {"x": null, "y": [ {"p": 2, "q": 1} ]}, "b": 1}"#)
                .unwrap();

        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"x":null,"y":[{"p":2,"q":1}]},"b":1}"#
        );
    }

    #[test]
    fn array_order_is_significant() {
        assert_ne!(digest(&json!([1, 2])), digest(&json!([2, 1])));
    }

    #[test]
    fn digest_is_hex_sha256() {
        let d = digest(&json!({"k": "v"}));
        assert_eq!(d.len(), 64);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
