//! `dataHash` computation (spec §3, §4.8): a stable hash of an entity's data
//! used to shortcut reconnect when the client's state already matches.
use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{
    Digest,
    Sha256,
};

/// Hashes `value`'s canonical JSON serialization: object keys are sorted
/// recursively before serializing, so two structurally-equal values hash
/// identically regardless of field insertion order. Mirrors the
/// `Sha256`/`Sha256Digest` content-addressing pattern used elsewhere, scoped
/// to key ordering rather than a full reimplementation of JSON
/// Canonicalization (RFC 8785).
pub fn data_hash(value: &Value) -> String {
    let bytes = serde_json::to_vec(&canonicalize(value)).expect("Value always serializes");
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        },
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn same_value_same_hash() {
        let a = json!({"x": 1, "y": [1, 2, 3]});
        let b = json!({"x": 1, "y": [1, 2, 3]});
        assert_eq!(data_hash(&a), data_hash(&b));
    }

    #[test]
    fn different_value_different_hash() {
        let a = json!({"x": 1});
        let b = json!({"x": 2});
        assert_ne!(data_hash(&a), data_hash(&b));
    }

    #[test]
    fn key_order_does_not_affect_hash() {
        let a = json!({"a": 1, "b": {"c": 2, "d": 3}});
        let b = json!({"b": {"d": 3, "c": 2}, "a": 1});
        assert_eq!(data_hash(&a), data_hash(&b));
    }
}
