//! Entry Signatures
//!
//! One long-lived Ed25519 keypair signs every entry. The 32-byte seed is
//! persisted on first use and reused afterwards; an existing key is never
//! replaced, even by `clear_history`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::info;

use crate::core::hash::{hash_bytes, EncodingError};
use crate::ledger::entry::{Entry, EntryDraft, SignedPayload};
use crate::storage::{KeyValueStore, StoreError, SIGNING_KEY_KEY};

/// Hex characters kept from the public key digest.
pub const FINGERPRINT_LEN: usize = 16;

/// Signature errors.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// The persisted key exists but cannot be decoded.
    #[error("persisted signing key is corrupt")]
    CorruptKey,
    /// Key storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Payload could not be encoded.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// Entry carries no signature.
    #[error("entry {0} is unsigned")]
    Unsigned(u64),
    /// Signature is malformed or does not verify.
    #[error("invalid signature on entry {0}")]
    Invalid(u64),
}

/// Signs and verifies entries with the persisted keypair.
pub struct SignatureService {
    signing: SigningKey,
    verifying: VerifyingKey,
    fingerprint: String,
}

impl std::fmt::Debug for SignatureService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureService")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl SignatureService {
    /// Load the persisted keypair, generating and saving one if none exists.
    pub fn load_or_generate(store: &dyn KeyValueStore) -> Result<Self, SignatureError> {
        if let Some(raw) = store.get(SIGNING_KEY_KEY)? {
            let bytes = hex::decode(raw.trim()).map_err(|_| SignatureError::CorruptKey)?;
            let seed: [u8; 32] = bytes.try_into().map_err(|_| SignatureError::CorruptKey)?;
            let service = Self::from_signing_key(SigningKey::from_bytes(&seed));
            info!(fingerprint = %service.fingerprint, "loaded signing key");
            return Ok(service);
        }

        let signing = SigningKey::generate(&mut OsRng);
        store.set(SIGNING_KEY_KEY, &hex::encode(signing.to_bytes()))?;
        let service = Self::from_signing_key(signing);
        info!(fingerprint = %service.fingerprint, "generated new signing key");
        Ok(service)
    }

    /// Wrap an existing key.
    pub fn from_signing_key(signing: SigningKey) -> Self {
        let verifying = signing.verifying_key();
        let fingerprint = fingerprint_of(&verifying);
        Self {
            signing,
            verifying,
            fingerprint,
        }
    }

    /// Short identifier of the public key.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Public key as hex.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying.to_bytes())
    }

    /// Sign a payload, returning the hex signature.
    pub fn sign(&self, payload: &SignedPayload<'_>) -> Result<String, SignatureError> {
        let signature = self.signing.sign(&payload.to_bytes()?);
        Ok(hex::encode(signature.to_bytes()))
    }

    /// Verify a hex signature over a payload.
    pub fn verify(&self, payload: &SignedPayload<'_>, signature_hex: &str) -> bool {
        let Ok(bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&bytes) else {
            return false;
        };
        match payload.to_bytes() {
            Ok(msg) => self.verifying.verify(&msg, &signature).is_ok(),
            Err(_) => false,
        }
    }

    /// Tag a draft with this key's fingerprint and sign it.
    pub fn sign_draft(&self, draft: &mut EntryDraft) -> Result<(), SignatureError> {
        draft.signer_fingerprint = Some(self.fingerprint.clone());
        draft.signature = Some(self.sign(&draft.signed_payload())?);
        Ok(())
    }

    /// Verify a finalized entry's signature.
    pub fn verify_entry(&self, entry: &Entry) -> Result<(), SignatureError> {
        let signature = entry
            .signature
            .as_deref()
            .ok_or(SignatureError::Unsigned(entry.id))?;
        if self.verify(&entry.signed_payload(), signature) {
            Ok(())
        } else {
            Err(SignatureError::Invalid(entry.id))
        }
    }
}

/// Fingerprint: leading hex of the SHA-256 of the public key bytes.
pub fn fingerprint_of(key: &VerifyingKey) -> String {
    let mut digest = hex::encode(hash_bytes(key.as_bytes()));
    digest.truncate(FINGERPRINT_LEN);
    digest
}
