//! Canonical JSON and SHA-256 helpers used for cache keys and fingerprints.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Serialize a JSON value with object keys sorted at every level
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => Value::String(s.clone()).to_string(),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let tree: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, to_canonical_json(v))).collect();
            let items: Vec<String> = tree
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), v))
                .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}

/// Hex SHA-256 of a string
pub fn hash_str(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Hex SHA-256 of a JSON value in canonical form
pub fn hash_json(value: &Value) -> String {
    hash_str(&to_canonical_json(value))
}
