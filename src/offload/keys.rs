//! Symmetric Key Schedule
//!
//! The ledger ciphertext is sealed with ChaCha20-Poly1305 under a key
//! derived from a persisted random seed:
//!
//! ```text
//! salt = SHA-256("PLAY_LEDGER_KEY_EPOCH_V1" || epoch_le)
//! key  = HKDF-SHA256(ikm = seed, salt).expand("play-ledger:chacha20poly1305:v1")
//! ```
//!
//! After `max_operations` encryptions the seed is replaced and the epoch
//! bumped. Each blob records its epoch. Seeds of earlier epochs are retained
//! until a blob under a newer epoch has been committed, so a write that fails
//! after rotating never strands the stored history.

use std::collections::BTreeMap;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info};

use super::protocol::{EncryptedBlob, IV_LEN};
use crate::core::hash::DomainHasher;
use crate::storage::{
    load_json, save_json, SharedStore, StoreError, CRYPTO_EPOCH_KEY, CRYPTO_OPERATIONS_KEY,
    CRYPTO_RETAINED_SEEDS_KEY, CRYPTO_SEED_KEY,
};

const EPOCH_DOMAIN: &[u8] = b"PLAY_LEDGER_KEY_EPOCH_V1";
const KEY_INFO: &[u8] = b"play-ledger:chacha20poly1305:v1";

/// Key schedule errors.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Persisting or loading key state failed.
    #[error("key store: {0}")]
    Store(#[from] StoreError),
    /// A persisted seed is not 32 hex-encoded bytes.
    #[error("persisted key seed is corrupt")]
    CorruptSeed,
    /// HKDF or cipher construction failed.
    #[error("key derivation failed")]
    Derivation,
    /// AEAD sealing failed.
    #[error("encryption failed")]
    Seal,
}

/// A derived key and the epoch it belongs to.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EpochKey {
    /// Rotation epoch.
    pub epoch: u64,
    /// ChaCha20-Poly1305 key.
    pub key: [u8; 32],
}

impl std::fmt::Debug for EpochKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochKey")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

/// Seeds of earlier epochs, hex by epoch.
type RetainedSeeds = BTreeMap<u64, String>;

/// Seed, epoch and operation counter for the ledger cipher.
///
/// Owned by the worker; nothing else touches the key records.
pub struct KeySchedule {
    store: SharedStore,
    max_operations: u64,
    cached: Option<EpochKey>,
}

impl KeySchedule {
    /// Create a schedule over `store`. `max_operations` is clamped to 1.
    pub fn new(store: SharedStore, max_operations: u64) -> Self {
        Self {
            store,
            max_operations: max_operations.max(1),
            cached: None,
        }
    }

    /// Current key rotation epoch.
    pub fn epoch(&self) -> Result<u64, KeyError> {
        Ok(load_json::<u64>(self.store.as_ref(), CRYPTO_EPOCH_KEY)?.unwrap_or(0))
    }

    /// Encryptions performed under the current seed.
    pub fn operations(&self) -> Result<u64, KeyError> {
        Ok(load_json::<u64>(self.store.as_ref(), CRYPTO_OPERATIONS_KEY)?.unwrap_or(0))
    }

    /// Epochs whose seeds are still retained, oldest first.
    pub fn retained_epochs(&self) -> Result<Vec<u64>, KeyError> {
        Ok(self.retained()?.into_keys().collect())
    }

    /// Key of the current epoch. Does not count as an operation.
    pub fn current_key(&mut self) -> Result<EpochKey, KeyError> {
        let epoch = self.epoch()?;
        if let Some(cached) = self.cached {
            if cached.epoch == epoch {
                return Ok(cached);
            }
        }

        let seed = self.load_or_create_seed()?;
        let key = EpochKey {
            epoch,
            key: derive_key(&seed, epoch)?,
        };
        self.cached = Some(key);
        Ok(key)
    }

    /// Key for decrypting a blob sealed under `epoch`. `None` once that
    /// epoch's seed has been retired.
    pub fn key_for_epoch(&mut self, epoch: u64) -> Result<Option<[u8; 32]>, KeyError> {
        if epoch == self.epoch()? {
            return Ok(Some(self.current_key()?.key));
        }
        match self.retained()?.get(&epoch) {
            Some(raw) => Ok(Some(derive_key(&decode_seed(raw)?, epoch)?)),
            None => Ok(None),
        }
    }

    /// Key for an encryption, rotating first if the current seed is spent.
    pub fn key_for_encrypt(&mut self) -> Result<EpochKey, KeyError> {
        let mut operations = self.operations()?;
        if operations >= self.max_operations {
            self.rotate()?;
            operations = 0;
        }
        save_json(self.store.as_ref(), CRYPTO_OPERATIONS_KEY, &(operations + 1))?;
        self.current_key()
    }

    /// Replace the seed and bump the epoch. The outgoing seed is retained.
    pub fn rotate(&mut self) -> Result<(), KeyError> {
        let epoch = self.epoch()?;
        let previous = self.load_or_create_seed()?;

        // Retain first, then epoch, then seed: an interrupted rotation
        // leaves every epoch derivable.
        let mut retained = self.retained()?;
        retained.insert(epoch, hex::encode(previous));
        save_json(self.store.as_ref(), CRYPTO_RETAINED_SEEDS_KEY, &retained)?;
        save_json(self.store.as_ref(), CRYPTO_EPOCH_KEY, &(epoch + 1))?;
        self.store.set(CRYPTO_SEED_KEY, &hex::encode(random_seed()))?;
        save_json(self.store.as_ref(), CRYPTO_OPERATIONS_KEY, &0u64)?;
        self.cached = None;

        info!(epoch = epoch + 1, retained = retained.len(), "rotated ledger encryption key");
        Ok(())
    }

    /// Drop retained seeds older than `committed`, the epoch of the blob
    /// now in the store. Returns how many were dropped.
    pub fn retire_before(&mut self, committed: u64) -> Result<usize, KeyError> {
        let mut retained = self.retained()?;
        let before = retained.len();
        retained.retain(|epoch, _| *epoch >= committed);
        let dropped = before - retained.len();

        if dropped > 0 {
            if retained.is_empty() {
                self.store.remove(CRYPTO_RETAINED_SEEDS_KEY)?;
            } else {
                save_json(self.store.as_ref(), CRYPTO_RETAINED_SEEDS_KEY, &retained)?;
            }
            debug!(committed, dropped, "retired old ledger keys");
        }
        Ok(dropped)
    }

    /// Drop the cached derived key and every retained seed.
    pub fn forget(&mut self) -> Result<(), KeyError> {
        self.cached = None;
        self.store.remove(CRYPTO_RETAINED_SEEDS_KEY)?;
        debug!("derived key cache cleared");
        Ok(())
    }

    fn retained(&self) -> Result<RetainedSeeds, KeyError> {
        Ok(load_json(self.store.as_ref(), CRYPTO_RETAINED_SEEDS_KEY)?.unwrap_or_default())
    }

    fn load_or_create_seed(&self) -> Result<[u8; 32], KeyError> {
        match self.store.get(CRYPTO_SEED_KEY)? {
            Some(raw) => decode_seed(&raw),
            None => {
                let seed = random_seed();
                self.store.set(CRYPTO_SEED_KEY, &hex::encode(seed))?;
                debug!("generated ledger key seed");
                Ok(seed)
            }
        }
    }
}

fn decode_seed(raw: &str) -> Result<[u8; 32], KeyError> {
    let bytes = hex::decode(raw.trim()).map_err(|_| KeyError::CorruptSeed)?;
    bytes.try_into().map_err(|_| KeyError::CorruptSeed)
}

fn random_seed() -> [u8; 32] {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    seed
}

fn derive_key(seed: &[u8; 32], epoch: u64) -> Result<[u8; 32], KeyError> {
    let mut salt = DomainHasher::new(EPOCH_DOMAIN);
    salt.update_u64(epoch);
    let salt = salt.finalize();

    let hk = Hkdf::<Sha256>::new(Some(&salt[..]), seed);
    let mut key = [0u8; 32];
    hk.expand(KEY_INFO, &mut key)
        .map_err(|_| KeyError::Derivation)?;
    Ok(key)
}

// =============================================================================
// AEAD
// =============================================================================

/// Seal `plaintext` under `key` with a fresh random nonce.
pub fn seal(key: &EpochKey, plaintext: &[u8]) -> Result<EncryptedBlob, KeyError> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = ChaCha20Poly1305::new_from_slice(&key.key).map_err(|_| KeyError::Derivation)?;
    let data = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| KeyError::Seal)?;

    Ok(EncryptedBlob {
        data,
        iv: iv.to_vec(),
        epoch: key.epoch,
    })
}

/// Open a blob. `None` on a malformed nonce or failed authentication.
pub fn open(key: &[u8; 32], blob: &EncryptedBlob) -> Option<Vec<u8>> {
    if blob.iv.len() != IV_LEN {
        return None;
    }
    let cipher = ChaCha20Poly1305::new_from_slice(key).ok()?;
    cipher
        .decrypt(Nonce::from_slice(&blob.iv), blob.data.as_slice())
        .ok()
}
