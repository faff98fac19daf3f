//! Canonical payload hashing.
//!
//! Payloads are hashed over their compact JSON form. Object keys serialize in
//! sorted order, so payloads that differ only in key order share a hash.
//! Numbers keep their literal digits, so `12.50` and `12.5` do not.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// Lowercase hex SHA-256 digest of a canonicalized payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PayloadHash(String);

impl PayloadHash {
    /// Hashes a payload.
    pub fn of(payload: &Value) -> Result<Self, CacheError> {
        let bytes = serde_json::to_vec(payload).map_err(|e| CacheError::Hashing {
            message: e.to_string(),
        })?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Returns the hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_ignores_key_order() {
        let a = serde_json::from_str::<Value>(r#"{"a":1,"b":[true,"x"]}"#).unwrap();
        let b = serde_json::from_str::<Value>(r#"{"b":[true,"x"],"a":1}"#).unwrap();
        assert_eq!(PayloadHash::of(&a).unwrap(), PayloadHash::of(&b).unwrap());
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = PayloadHash::of(&json!({"active": true})).unwrap();
        let b = PayloadHash::of(&json!({"active": false})).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_distinguishes_number_literals() {
        let a = serde_json::from_str::<Value>(r#"{"value":12.50}"#).unwrap();
        let b = serde_json::from_str::<Value>(r#"{"value":12.5}"#).unwrap();
        assert_ne!(PayloadHash::of(&a).unwrap(), PayloadHash::of(&b).unwrap());
    }
}
