//! Canonical payload hashing.
//!
//! Pre-image: compact JSON, no HTML escaping, no trailing newline, object
//! keys sorted at every depth, and `\u000c` spelled as `\f`. Both ends of the
//! tunnel must arrive at the same bytes whatever JSON encoder they use.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde::Serialize;
use serde_json::{Map, Value};
use sha3::{Digest, Sha3_256};

use crate::error::Result;

pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Sorted-key JSON text that gets hashed.
pub fn canonical_json<T: Serialize + ?Sized>(payload: &T) -> Result<String> {
    let value = sort_keys(serde_json::to_value(payload)?);
    let text = serde_json::to_string(&value)?;
    Ok(text.replace("\\u000c", "\\f"))
}

pub fn hash_payload<T: Serialize + ?Sized>(payload: &T) -> Result<[u8; 32]> {
    Ok(sha3_256(canonical_json(payload)?.as_bytes()))
}

/// Base64 of [`hash_payload`], the form used for hash pointers.
pub fn hash_payload_b64<T: Serialize + ?Sized>(payload: &T) -> Result<String> {
    Ok(STANDARD.encode(hash_payload(payload)?))
}

/// Fresh 32-byte random value, base64. Same length as a hash pointer.
pub fn nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, sort_keys(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
