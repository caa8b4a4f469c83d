//! Local Key-Value Persistence
//!
//! Every persisted record of the ledger (ciphertext, digest, key material,
//! replay and rate-limit state, audit trail) is a string value under a fixed
//! key. [`FileStore`] keeps one file per key; [`MemoryStore`] backs tests.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Encrypted serialized chain.
pub const LEDGER_CIPHERTEXT_KEY: &str = "ledger_ciphertext";
/// Hex digest of the plaintext chain.
pub const LEDGER_DIGEST_KEY: &str = "ledger_digest";
/// Ed25519 signing seed (hex).
pub const SIGNING_KEY_KEY: &str = "signing_key";
/// Symmetric key seed (hex).
pub const CRYPTO_SEED_KEY: &str = "crypto_seed";
/// Symmetric key rotation epoch.
pub const CRYPTO_EPOCH_KEY: &str = "crypto_epoch";
/// Seeds of earlier epochs not yet retired.
pub const CRYPTO_RETAINED_SEEDS_KEY: &str = "crypto_retained_seeds";
/// Encryptions performed under the current seed.
pub const CRYPTO_OPERATIONS_KEY: &str = "crypto_operations";
/// Consumed replay nonces.
pub const REPLAY_NONCES_KEY: &str = "replay_nonces";
/// Recent write timestamps.
pub const RATE_LIMIT_KEY: &str = "rate_limit_window";
/// Audit trail.
pub const AUDIT_LOG_KEY: &str = "audit_log";

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A stored value could not be encoded or decoded.
    #[error("storage codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// A lock was poisoned by a panicking writer.
    #[error("storage lock poisoned")]
    Poisoned,
}

/// String-valued key-value store.
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if absent.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write (overwrite) a value.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete a value. Deleting an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Shared store handle.
pub type SharedStore = Arc<dyn KeyValueStore>;

/// Read and decode a JSON value.
pub fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        values.remove(key);
        Ok(())
    }
}

/// Directory-backed store, one `<key>.json` file per record.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        // Records are replaced atomically; the two ledger records are not.
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KeyValueStore) {
        assert_eq!(store.get("missing").unwrap(), None);

        store.set("alpha", "1").unwrap();
        store.set("alpha", "2").unwrap();
        assert_eq!(store.get("alpha").unwrap().as_deref(), Some("2"));

        store.remove("alpha").unwrap();
        store.remove("alpha").unwrap();
        assert_eq!(store.get("alpha").unwrap(), None);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        exercise(&store);
        assert!(store.values.lock().unwrap().is_empty());
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("nested")).unwrap();
        exercise(&store);

        store.set(LEDGER_DIGEST_KEY, "abc").unwrap();
        let reopened = FileStore::open(store.dir()).unwrap();
        assert_eq!(reopened.get(LEDGER_DIGEST_KEY).unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn test_json_helpers() {
        let store = MemoryStore::new();
        save_json(&store, RATE_LIMIT_KEY, &vec![1u64, 2, 3]).unwrap();
        let loaded: Option<Vec<u64>> = load_json(&store, RATE_LIMIT_KEY).unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));

        store.set("bad", "not json").unwrap();
        let bad: Result<Option<Vec<u64>>, _> = load_json(&store, "bad");
        assert!(matches!(bad, Err(StoreError::Codec(_))));
    }
}
