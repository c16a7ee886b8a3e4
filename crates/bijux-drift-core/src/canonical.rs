//! Content-derived ids for mismatches, fixes and tickets.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex digits of the sha256 kept in a short content id.
pub const ID_HEX_LEN: usize = 16;

fn with_sorted_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, inner)| (key, with_sorted_keys(inner)))
                .collect::<BTreeMap<_, _>>()
                .into_iter()
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(with_sorted_keys).collect()),
        other => other,
    }
}

/// Compact JSON with object keys ordered at every depth.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&with_sorted_keys(serde_json::to_value(value)?))
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// `<prefix>_<first ID_HEX_LEN hex of sha256(canonical json)>`.
pub fn short_content_id<T: Serialize>(prefix: &str, value: &T) -> Result<String, serde_json::Error> {
    let digest = sha256_hex(canonical_json(value)?.as_bytes());
    Ok(format!("{prefix}_{}", &digest[..ID_HEX_LEN]))
}
