//! Offload Protocol Messages
//!
//! Wire format between the caller and the crypto worker. Only these JSON
//! strings cross the boundary; the two sides share no mutable state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Length of the AEAD nonce (`iv`).
pub const IV_LEN: usize = 12;

/// Operations the worker performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    /// Encrypt a JSON value under the derived key.
    Encrypt,
    /// Decrypt an [`EncryptedBlob`]; `null` result on malformed input.
    Decrypt,
    /// Hex SHA-256 of the canonical encoding.
    Hash,
    /// Hash-chain validation.
    ValidateChain,
    /// Drop the cached derived key and retained seeds.
    ForgetKey,
    /// Drop retained seeds older than the committed epoch.
    RetireKeys,
}

/// Caller -> worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffloadRequest {
    /// Correlation id, strictly increasing per channel.
    pub id: u64,
    /// Operation to perform.
    pub operation: Operation,
    /// Operation-specific input.
    #[serde(default)]
    pub payload: Value,
    /// Unix ms after which the caller has stopped waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<u64>,
}

/// Worker -> caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffloadResponse {
    /// Correlation id of the request.
    pub id: u64,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Operation-specific output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OffloadResponse {
    /// Successful response.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response.
    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Encrypted payload as persisted under `ledger_ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    /// Ciphertext including the authentication tag.
    pub data: Vec<u8>,
    /// AEAD nonce, [`IV_LEN`] bytes.
    pub iv: Vec<u8>,
    /// Key rotation epoch the blob was sealed under.
    #[serde(default)]
    pub epoch: u64,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl OffloadRequest {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl OffloadResponse {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
