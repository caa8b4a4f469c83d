//! Play Entries
//!
//! One entry is one recorded play and one block of the hash chain.
//! JSON field names are camelCase; this is the persisted format.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::hash::{canonical_json, digest_hex, EncodingError};

/// `previousHash` of the first entry in every chain.
pub const GENESIS_HASH: &str = "0";

/// Numbers per play.
pub const NUMBERS_PER_PLAY: usize = 6;

/// Smallest playable number.
pub const MIN_NUMBER: i64 = 0;

/// Largest playable number.
pub const MAX_NUMBER: i64 = 45;

/// Play modes offered by the draw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayMode {
    /// Main draw.
    #[default]
    Standard,
    /// Second draw with the same numbers.
    SecondChance,
    /// Rematch draw.
    Rematch,
    /// Guaranteed-prize draw.
    AlwaysWins,
}

impl std::fmt::Display for PlayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Standard => "standard",
            Self::SecondChance => "second_chance",
            Self::Rematch => "rematch",
            Self::AlwaysWins => "always_wins",
        };
        f.write_str(name)
    }
}

/// A rule a play's numbers must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberRule {
    /// Exactly six numbers.
    ExactCount,
    /// Every number within `MIN_NUMBER..=MAX_NUMBER`.
    Range,
    /// No number repeated.
    Unique,
}

impl std::fmt::Display for NumberRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExactCount => write!(f, "must contain exactly {} numbers", NUMBERS_PER_PLAY),
            Self::Range => write!(f, "every number must be between {} and {}", MIN_NUMBER, MAX_NUMBER),
            Self::Unique => write!(f, "numbers must be unique"),
        }
    }
}

/// Malformed play numbers. Lists every violated rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid play: {}", describe(.violations))]
pub struct ValidationError {
    /// Violated rules, in rule order.
    pub violations: Vec<NumberRule>,
}

impl ValidationError {
    /// Check whether a given rule was violated.
    pub fn violates(&self, rule: NumberRule) -> bool {
        self.violations.contains(&rule)
    }
}

fn describe(violations: &[NumberRule]) -> String {
    violations
        .iter()
        .map(|rule| rule.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validate raw play numbers and narrow them to bytes.
///
/// All rules are checked independently, so the error reports every problem.
pub fn validate_numbers(numbers: &[i64]) -> Result<Vec<u8>, ValidationError> {
    let mut violations = Vec::new();

    if numbers.len() != NUMBERS_PER_PLAY {
        violations.push(NumberRule::ExactCount);
    }

    if numbers.iter().any(|n| !(MIN_NUMBER..=MAX_NUMBER).contains(n)) {
        violations.push(NumberRule::Range);
    }

    let mut seen = std::collections::BTreeSet::new();
    if !numbers.iter().all(|n| seen.insert(*n)) {
        violations.push(NumberRule::Unique);
    }

    if !violations.is_empty() {
        return Err(ValidationError { violations });
    }

    // In range, so the narrowing is lossless.
    Ok(numbers.iter().map(|n| *n as u8).collect())
}

/// A finalized play record and chain block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Creation timestamp (Unix ms), unique within a chain.
    pub id: u64,
    /// ISO-8601 creation time, informational.
    pub created_at: String,
    /// The six played numbers.
    pub numbers: Vec<u8>,
    /// Play mode.
    pub mode: PlayMode,
    /// Draw the play was made for, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draw_id: Option<u64>,
    /// Replay session the entry was admitted under.
    #[serde(default)]
    pub session_id: String,
    /// Replay nonce the entry was admitted under.
    #[serde(default)]
    pub nonce: String,
    /// Replay token timestamp (Unix ms).
    pub request_timestamp: u64,
    /// Hex Ed25519 signature over [`SignedPayload`]. Absent on legacy entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Fingerprint of the signing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_fingerprint: Option<String>,
    /// `block_hash` of the prior entry, or [`GENESIS_HASH`].
    pub previous_hash: String,
    /// Digest of [`BlockHashInput`].
    pub block_hash: String,
    /// Position in the chain.
    pub index: u64,
}

/// An entry before it is linked into the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDraft {
    /// Creation timestamp (Unix ms).
    pub id: u64,
    /// ISO-8601 creation time.
    pub created_at: String,
    /// Validated numbers.
    pub numbers: Vec<u8>,
    /// Play mode.
    pub mode: PlayMode,
    /// Draw reference.
    pub draw_id: Option<u64>,
    /// Replay session.
    pub session_id: String,
    /// Replay nonce.
    pub nonce: String,
    /// Replay token timestamp.
    pub request_timestamp: u64,
    /// Hex signature, attached after signing.
    pub signature: Option<String>,
    /// Signer fingerprint.
    pub signer_fingerprint: Option<String>,
}

/// Fields covered by `block_hash`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHashInput<'a> {
    id: u64,
    created_at: &'a str,
    numbers: &'a [u8],
    mode: PlayMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    draw_id: Option<u64>,
    request_timestamp: u64,
    previous_hash: &'a str,
}

impl BlockHashInput<'_> {
    /// Hex digest of the canonical encoding.
    pub fn digest(&self) -> Result<String, EncodingError> {
        digest_hex(self)
    }
}

/// Fields covered by the signature: everything except the signature and the
/// linkage fields assigned at append time.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPayload<'a> {
    id: u64,
    created_at: &'a str,
    numbers: &'a [u8],
    mode: PlayMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    draw_id: Option<u64>,
    session_id: &'a str,
    nonce: &'a str,
    request_timestamp: u64,
    signer_fingerprint: Option<&'a str>,
}

impl SignedPayload<'_> {
    /// Canonical bytes to sign or verify.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        canonical_json(self)
    }
}

impl EntryDraft {
    /// Payload to sign.
    pub fn signed_payload(&self) -> SignedPayload<'_> {
        SignedPayload {
            id: self.id,
            created_at: &self.created_at,
            numbers: &self.numbers,
            mode: self.mode,
            draw_id: self.draw_id,
            session_id: &self.session_id,
            nonce: &self.nonce,
            request_timestamp: self.request_timestamp,
            signer_fingerprint: self.signer_fingerprint.as_deref(),
        }
    }

    /// Finalize into a linked entry.
    pub fn link(self, previous_hash: String, index: u64) -> Result<Entry, EncodingError> {
        let mut entry = Entry {
            id: self.id,
            created_at: self.created_at,
            numbers: self.numbers,
            mode: self.mode,
            draw_id: self.draw_id,
            session_id: self.session_id,
            nonce: self.nonce,
            request_timestamp: self.request_timestamp,
            signature: self.signature,
            signer_fingerprint: self.signer_fingerprint,
            previous_hash,
            block_hash: String::new(),
            index,
        };
        entry.block_hash = entry.compute_block_hash()?;
        Ok(entry)
    }
}

impl Entry {
    /// Fields covered by `block_hash`.
    pub fn block_hash_input(&self) -> BlockHashInput<'_> {
        BlockHashInput {
            id: self.id,
            created_at: &self.created_at,
            numbers: &self.numbers,
            mode: self.mode,
            draw_id: self.draw_id,
            request_timestamp: self.request_timestamp,
            previous_hash: &self.previous_hash,
        }
    }

    /// Recompute the block hash from the stored fields.
    pub fn compute_block_hash(&self) -> Result<String, EncodingError> {
        self.block_hash_input().digest()
    }

    /// Payload the signature covers.
    pub fn signed_payload(&self) -> SignedPayload<'_> {
        SignedPayload {
            id: self.id,
            created_at: &self.created_at,
            numbers: &self.numbers,
            mode: self.mode,
            draw_id: self.draw_id,
            session_id: &self.session_id,
            nonce: &self.nonce,
            request_timestamp: self.request_timestamp,
            signer_fingerprint: self.signer_fingerprint.as_deref(),
        }
    }

    /// True if the entry carries a signature.
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn draft(id: u64, numbers: [u8; 6]) -> EntryDraft {
        EntryDraft {
            id,
            created_at: crate::core::clock::format_millis(id),
            numbers: numbers.to_vec(),
            mode: PlayMode::Standard,
            draw_id: None,
            session_id: "session".into(),
            nonce: format!("session-{id}-00ff"),
            request_timestamp: id,
            signature: None,
            signer_fingerprint: None,
        }
    }

    #[test]
    fn test_valid_numbers_accepted() {
        let numbers = validate_numbers(&[0, 7, 14, 21, 28, 45]).unwrap();
        assert_eq!(numbers, vec![0, 7, 14, 21, 28, 45]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = validate_numbers(&[1, 1, 2, 3, 4, 5]).unwrap_err();
        assert_eq!(err.violations, vec![NumberRule::Unique]);
        assert!(err.to_string().contains("unique"));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let err = validate_numbers(&[0, 1, 2, 3, 4, 46]).unwrap_err();
        assert_eq!(err.violations, vec![NumberRule::Range]);

        let err = validate_numbers(&[-1, 1, 2, 3, 4, 5]).unwrap_err();
        assert!(err.violates(NumberRule::Range));
    }

    #[test]
    fn test_all_violations_reported() {
        let err = validate_numbers(&[50, 50, 3]).unwrap_err();
        assert_eq!(
            err.violations,
            vec![NumberRule::ExactCount, NumberRule::Range, NumberRule::Unique]
        );
    }

    #[test]
    fn test_block_hash_ignores_signature() {
        let mut signed = draft(1, [1, 2, 3, 4, 5, 6]);
        signed.signature = Some("abcd".into());
        let unsigned = draft(1, [1, 2, 3, 4, 5, 6]);

        let a = signed.link(GENESIS_HASH.into(), 0).unwrap();
        let b = unsigned.link(GENESIS_HASH.into(), 0).unwrap();
        assert_eq!(a.block_hash, b.block_hash);
    }

    #[test]
    fn test_signed_payload_matches_draft() {
        let draft = draft(7, [1, 2, 3, 4, 5, 6]);
        let before = draft.signed_payload().to_bytes().unwrap();
        let entry = draft.link(GENESIS_HASH.into(), 0).unwrap();
        assert_eq!(entry.signed_payload().to_bytes().unwrap(), before);
    }

    #[test]
    fn test_entry_json_field_names() {
        let entry = draft(1, [1, 2, 3, 4, 5, 6]).link(GENESIS_HASH.into(), 0).unwrap();
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("previousHash").is_some());
        assert!(json.get("blockHash").is_some());
        assert!(json.get("requestTimestamp").is_some());
        assert!(json.get("signature").is_none());
        assert_eq!(json["mode"], "standard");
    }

    #[test]
    fn test_legacy_entry_without_replay_fields_parses() {
        let raw = r#"{"id":1,"createdAt":"x","numbers":[1,2,3,4,5,6],"mode":"rematch",
            "requestTimestamp":1,"previousHash":"0","blockHash":"h","index":0}"#;
        let entry: Entry = serde_json::from_str(raw).unwrap();
        assert!(!entry.is_signed());
        assert_eq!(entry.mode, PlayMode::Rematch);
        assert!(entry.session_id.is_empty());
        assert_eq!(entry.draw_id, None);
    }

    #[test]
    fn test_draw_id_covered_by_hash_and_signature() {
        let plain = draft(3, [1, 2, 3, 4, 5, 6]);
        let mut tagged = draft(3, [1, 2, 3, 4, 5, 6]);
        tagged.draw_id = Some(3_120);

        assert_ne!(
            plain.signed_payload().to_bytes().unwrap(),
            tagged.signed_payload().to_bytes().unwrap()
        );

        let plain = plain.link(GENESIS_HASH.into(), 0).unwrap();
        let tagged = tagged.link(GENESIS_HASH.into(), 0).unwrap();
        assert_ne!(plain.block_hash, tagged.block_hash);
        assert!(serde_json::to_value(&plain).unwrap().get("drawId").is_none());
        assert_eq!(serde_json::to_value(&tagged).unwrap()["drawId"], 3_120);
    }
}
