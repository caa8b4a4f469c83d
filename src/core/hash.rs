//! Canonical Hashing
//!
//! Provides deterministic hashing of ledger data for:
//! - Block hashes and chain linkage
//! - Tamper digests of the persisted chain
//! - Public key fingerprints
//!
//! Every value is hashed over its canonical JSON encoding: object keys are
//! sorted, so two structurally equal values always produce the same bytes.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hash output type (256 bits / 32 bytes)
pub type Digest256 = [u8; 32];

/// Errors raised while producing a canonical encoding.
#[derive(Debug, thiserror::Error)]
#[error("canonical encoding failed: {0}")]
pub struct EncodingError(#[from] serde_json::Error);

/// Encode a value as canonical JSON bytes.
///
/// Round-trips through `serde_json::Value`, whose object map is ordered, so
/// field order in the source type does not leak into the encoding.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Incremental SHA-256 hasher with a domain separator.
///
/// Order of updates is significant.
pub struct DomainHasher {
    hasher: Sha256,
}

impl DomainHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> Digest256 {
        self.hasher.finalize().into()
    }
}

/// Compute a plain SHA-256 of arbitrary data.
pub fn hash_bytes(data: &[u8]) -> Digest256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 of the canonical encoding, as lowercase hex.
pub fn digest_hex<T: Serialize + ?Sized>(value: &T) -> Result<String, EncodingError> {
    Ok(hex::encode(hash_bytes(&canonical_json(value)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Ab {
        a: u32,
        b: u32,
    }

    #[derive(Serialize)]
    struct Ba {
        b: u32,
        a: u32,
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let one = canonical_json(&Ab { a: 1, b: 2 }).unwrap();
        let two = canonical_json(&Ba { b: 2, a: 1 }).unwrap();
        assert_eq!(one, two);
        assert_eq!(one, br#"{"a":1,"b":2}"#.to_vec());
    }

    #[test]
    fn test_digest_hex_is_lowercase_sha256() {
        let digest = digest_hex(&json!([1, 2, 3])).unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(digest, hex::encode(hash_bytes(b"[1,2,3]")));
    }

    #[test]
    fn test_hash_order_matters() {
        let hash1 = {
            let mut h = DomainHasher::new(b"test");
            h.update_u64(1);
            h.update_u64(2);
            h.finalize()
        };

        let hash2 = {
            let mut h = DomainHasher::new(b"test");
            h.update_u64(2);
            h.update_u64(1);
            h.finalize()
        };

        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_domain_separation() {
        let hash = |domain: &[u8]| {
            let mut h = DomainHasher::new(domain);
            h.update_u64(7);
            h.finalize()
        };

        let hash1 = hash(b"DOMAIN_A");
        let hash2 = hash(b"DOMAIN_B");

        assert_ne!(hash1, hash2);
    }
}
