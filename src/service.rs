//! Ledger Orchestrator
//!
//! [`LedgerService`] is the only entry point callers use. It composes the
//! rate limiter, replay guard, signer, hash chain and crypto channel.
//!
//! ```text
//!  record_play                         list_plays
//!  ───────────                         ──────────
//!  rate limit                          load ciphertext + digest
//!  validate numbers                    decrypt        ─┐
//!  issue + validate replay token       digest check    │ integrity:
//!  sign                                validate chain ─┘ fail closed
//!  append (copy)                       verify signatures (drop bad)
//!  encrypt + hash, persist             newest first
//!  retire old key seeds
//!  commit, audit
//! ```
//!
//! Writes are serialized by one lock shared by every clone of the service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::LedgerConfig;
use crate::core::clock::SharedClock;
use crate::core::hash::EncodingError;
use crate::ledger::{
    validate_numbers, AppendOnlyViolation, ChainFault, Entry, EntryDraft, HashChain, PlayMode,
    ValidationError,
};
use crate::offload::{ChannelError, CryptoChannel, EncryptedBlob, KeySchedule};
use crate::security::{
    AuditEvent, AuditKind, AuditLog, RateDecision, RateLimiter, ReplayGuard, SignatureError,
    SignatureService,
};
use crate::storage::{save_json, SharedStore, StoreError, LEDGER_CIPHERTEXT_KEY, LEDGER_DIGEST_KEY};

/// Matches needed for a winning play.
pub const WINNING_MATCHES: usize = 4;

// =============================================================================
// ERRORS
// =============================================================================

/// Why persisted ledger data was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IntegrityFailure {
    /// Ciphertext is malformed or fails authentication.
    #[error("ledger could not be decrypted")]
    Undecryptable,
    /// Ciphertext present without a digest.
    #[error("ledger digest missing")]
    MissingDigest,
    /// Digest does not match the decrypted chain.
    #[error("ledger digest mismatch")]
    DigestMismatch,
    /// Hash or link check failed.
    #[error("ledger chain is broken")]
    BrokenChain,
}

impl IntegrityFailure {
    fn reason(&self) -> &'static str {
        match self {
            Self::Undecryptable => "decryption_failed",
            Self::MissingDigest => "digest_missing",
            Self::DigestMismatch => "hash_mismatch",
            Self::BrokenChain => "chain_integrity_failed",
        }
    }
}

/// Ledger operation errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Numbers broke one or more rules.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Too many writes in the window.
    #[error("too many plays, retry in {retry_after_secs}s")]
    RateLimited {
        /// Seconds until a write is allowed again.
        retry_after_secs: u64,
    },
    /// Replay check failed. The detailed reason is only logged.
    #[error("request rejected")]
    Replay,
    /// Persisted data failed an integrity check.
    #[error("integrity error: {0}")]
    Integrity(IntegrityFailure),
    /// Signing failed.
    #[error(transparent)]
    Signature(#[from] SignatureError),
    /// Offload request failed or timed out.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// Store failure.
    #[error(transparent)]
    Storage(#[from] StoreError),
    /// Canonical encoding failed.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// Deletion attempted.
    #[error(transparent)]
    AppendOnly(#[from] AppendOnlyViolation),
    /// No accepted play with this id.
    #[error("play {0} not found")]
    NotFound(u64),
    /// Crypto worker thread could not be started.
    #[error("failed to start crypto worker: {0}")]
    Worker(#[from] std::io::Error),
}

// =============================================================================
// EXPORT / CHECK TYPES
// =============================================================================

/// Summary of one play in an audit export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaySummary {
    /// Play id.
    pub id: u64,
    /// ISO-8601 creation time.
    pub created_at: String,
    /// Play mode.
    pub mode: PlayMode,
    /// Draw reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draw_id: Option<u64>,
    /// Whether the play carries a signature.
    pub has_signature: bool,
    /// Fingerprint of the signer.
    pub signer_fingerprint: Option<String>,
}

/// Audit export of the accepted ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditExport {
    /// ISO-8601 export time.
    pub export_date: String,
    /// Fingerprint of the current signing key.
    pub fingerprint: String,
    /// Hex public key, for verifying the exported plays elsewhere.
    pub public_key: String,
    /// Number of accepted plays.
    pub total_plays: usize,
    /// Accepted plays, newest first.
    pub plays: Vec<PlaySummary>,
}

/// Outcome of checking a play against a draw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayCheck {
    /// Play id.
    pub play_id: u64,
    /// Draw the play was made for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draw_id: Option<u64>,
    /// Played numbers also drawn, in play order.
    pub matched: Vec<u8>,
    /// At least [`WINNING_MATCHES`] matches.
    pub winner: bool,
}

// =============================================================================
// SERVICE
// =============================================================================

struct WriteState {
    rate: RateLimiter,
    replay: ReplayGuard,
    /// Loaded lazily on the first write.
    chain: Option<HashChain>,
}

struct Inner {
    config: LedgerConfig,
    clock: SharedClock,
    store: SharedStore,
    signer: SignatureService,
    channel: CryptoChannel,
    state: Mutex<WriteState>,
    audit: Mutex<AuditLog>,
    listing: AtomicBool,
}

/// The secure play ledger. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct LedgerService {
    inner: Arc<Inner>,
}

/// Resets the listing flag on drop.
struct ListingGuard<'a>(&'a AtomicBool);

impl<'a> ListingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ListingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl LedgerService {
    /// Open the ledger over `store`, loading or generating the signing key
    /// and starting the crypto worker. Must be called inside a Tokio runtime.
    pub fn open(
        config: LedgerConfig,
        store: SharedStore,
        clock: SharedClock,
    ) -> Result<Self, LedgerError> {
        let keys = KeySchedule::new(store.clone(), config.max_operations_per_key);
        let channel = CryptoChannel::spawn(keys, clock.clone(), config.channel())?;
        Self::with_channel(config, store, clock, channel)
    }

    fn with_channel(
        config: LedgerConfig,
        store: SharedStore,
        clock: SharedClock,
        channel: CryptoChannel,
    ) -> Result<Self, LedgerError> {
        let signer = SignatureService::load_or_generate(store.as_ref())?;

        let state = WriteState {
            rate: RateLimiter::new(config.rate_limit(), clock.clone(), store.clone()),
            replay: ReplayGuard::new(config.replay(), clock.clone(), store.clone()),
            chain: None,
        };
        let audit = AuditLog::new(config.audit_capacity, clock.clone(), store.clone());

        info!(fingerprint = %signer.fingerprint(), "ledger opened");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                clock,
                store,
                signer,
                channel,
                state: Mutex::new(state),
                audit: Mutex::new(audit),
                listing: AtomicBool::new(false),
            }),
        })
    }

    /// Signer fingerprint.
    pub fn fingerprint(&self) -> &str {
        self.inner.signer.fingerprint()
    }

    /// Snapshot of the audit trail, oldest first.
    pub async fn audit_log(&self) -> Vec<AuditEvent> {
        self.inner.audit.lock().await.events().to_vec()
    }

    /// Record a play.
    pub async fn record_play(&self, numbers: &[i64], mode: PlayMode) -> Result<Entry, LedgerError> {
        self.record_draw_play(numbers, mode, None).await
    }

    /// Record a play made for a specific draw.
    #[instrument(skip(self))]
    pub async fn record_draw_play(
        &self,
        numbers: &[i64],
        mode: PlayMode,
        draw_id: Option<u64>,
    ) -> Result<Entry, LedgerError> {
        let mut state = self.inner.state.lock().await;

        if let RateDecision::Denied { retry_after_secs } = state.rate.check() {
            self.audit(
                AuditKind::SecurityViolation,
                json!({
                    "reason": "rate_limit_exceeded",
                    "retryAfterSecs": retry_after_secs,
                    "writesInWindow": state.rate.in_window(),
                    "fingerprint": self.fingerprint(),
                }),
            )
            .await;
            return Err(LedgerError::RateLimited { retry_after_secs });
        }

        let numbers = validate_numbers(numbers)?;

        let token = state.replay.issue_token();
        if let Err(rejection) = state.replay.validate(token.timestamp, &token.nonce) {
            warn!(%rejection, session = %token.session_id, "replay check failed");
            self.audit(
                AuditKind::SecurityViolation,
                json!({ "reason": "replay_attack_detected", "details": rejection.to_string() }),
            )
            .await;
            return Err(LedgerError::Replay);
        }

        self.ensure_chain(&mut state).await?;
        let mut next = state.chain.clone().unwrap_or_default();

        // Ids are creation timestamps, bumped to stay unique.
        let id = match next.tail() {
            Some(tail) if tail.id >= token.timestamp => tail.id + 1,
            _ => token.timestamp,
        };
        let mut draft = EntryDraft {
            id,
            created_at: self.inner.clock.now_iso8601(),
            numbers,
            mode,
            draw_id,
            session_id: token.session_id,
            nonce: token.nonce,
            request_timestamp: token.timestamp,
            signature: None,
            signer_fingerprint: None,
        };
        self.inner.signer.sign_draft(&mut draft)?;

        let entry = next.append(draft)?;
        self.persist(next.entries()).await?;
        state.chain = Some(next);

        let signature_prefix: String = entry
            .signature
            .as_deref()
            .unwrap_or_default()
            .chars()
            .take(16)
            .collect();
        self.audit(
            AuditKind::PlayCreated,
            json!({
                "id": entry.id,
                "mode": entry.mode,
                "drawId": entry.draw_id,
                "signature": signature_prefix,
                "fingerprint": entry.signer_fingerprint,
                "sessionId": entry.session_id,
            }),
        )
        .await;

        Ok(entry)
    }

    /// Accepted plays, newest first.
    ///
    /// Integrity failures yield an empty list. A second call while one is in
    /// flight also yields an empty list.
    #[instrument(skip(self))]
    pub async fn list_plays(&self) -> Result<Vec<Entry>, LedgerError> {
        let Some(_listing) = ListingGuard::acquire(&self.inner.listing) else {
            debug!("list already in flight");
            return Ok(Vec::new());
        };

        let (ciphertext, digest) = {
            let _state = self.inner.state.lock().await;
            (
                self.inner.store.get(LEDGER_CIPHERTEXT_KEY)?,
                self.inner.store.get(LEDGER_DIGEST_KEY)?,
            )
        };

        let entries = match self.decrypt_entries(ciphertext, digest).await {
            Ok(entries) => entries,
            Err(LedgerError::Integrity(failure)) => {
                self.report_integrity(failure, None).await;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        if entries.is_empty() {
            return Ok(entries);
        }

        if !self.inner.channel.validate_chain(entries.clone()).await? {
            let fault = HashChain::find_fault(&entries);
            self.report_integrity(IntegrityFailure::BrokenChain, fault).await;
            return Ok(Vec::new());
        }

        let mut accepted = Vec::with_capacity(entries.len());
        for entry in entries {
            if !entry.is_signed() {
                accepted.push(entry);
                continue;
            }
            match self.inner.signer.verify_entry(&entry) {
                Ok(()) => accepted.push(entry),
                Err(e) => {
                    warn!(id = entry.id, "dropping entry: {}", e);
                    self.audit(
                        AuditKind::SecurityViolation,
                        json!({ "reason": "invalid_signature", "id": entry.id }),
                    )
                    .await;
                }
            }
        }

        accepted.reverse();
        Ok(accepted)
    }

    /// Discard the persisted chain and start over. The signing key is kept.
    #[instrument(skip(self))]
    pub async fn clear_history(&self) -> Result<(), LedgerError> {
        let mut state = self.inner.state.lock().await;

        self.inner.store.remove(LEDGER_CIPHERTEXT_KEY)?;
        self.inner.store.remove(LEDGER_DIGEST_KEY)?;
        state.chain = Some(HashChain::new());
        state.replay.prune(self.inner.config.nonce_max_age);
        self.inner.channel.forget_key().await?;

        self.audit(AuditKind::HistoryCleared, json!({ "action": "ledger_reset" }))
            .await;
        Ok(())
    }

    /// Always rejected: the ledger is append-only.
    #[instrument(skip(self))]
    pub async fn delete_play(&self, id: u64) -> Result<(), LedgerError> {
        let mut state = self.inner.state.lock().await;
        let result = match state.chain.as_mut() {
            Some(chain) => chain.remove(id),
            None => Err(AppendOnlyViolation(id)),
        };
        drop(state);

        if let Err(violation) = result {
            warn!(id, "deletion attempt rejected");
            self.audit(
                AuditKind::SecurityViolation,
                json!({ "reason": "delete_attempt", "id": id }),
            )
            .await;
            return Err(violation.into());
        }
        Ok(())
    }

    /// Check an accepted play against drawn numbers.
    #[instrument(skip(self))]
    pub async fn check_play(&self, id: u64, drawn: &[u8]) -> Result<PlayCheck, LedgerError> {
        let plays = self.list_plays().await?;
        let play = plays
            .iter()
            .find(|p| p.id == id)
            .ok_or(LedgerError::NotFound(id))?;

        let check = score(play, drawn);
        self.audit_check(&check).await;
        Ok(check)
    }

    /// Check every accepted play made for `draw_id`, newest first.
    #[instrument(skip(self))]
    pub async fn check_draw(&self, draw_id: u64, drawn: &[u8]) -> Result<Vec<PlayCheck>, LedgerError> {
        let checks: Vec<PlayCheck> = self
            .list_plays()
            .await?
            .iter()
            .filter(|p| p.draw_id == Some(draw_id))
            .map(|p| score(p, drawn))
            .collect();

        for check in &checks {
            self.audit_check(check).await;
        }
        Ok(checks)
    }

    /// Export a summary of the accepted plays.
    pub async fn export_audit_data(&self) -> Result<AuditExport, LedgerError> {
        let plays = self.list_plays().await?;
        Ok(AuditExport {
            export_date: self.inner.clock.now_iso8601(),
            fingerprint: self.fingerprint().to_string(),
            public_key: self.inner.signer.public_key_hex(),
            total_plays: plays.len(),
            plays: plays
                .into_iter()
                .map(|p| PlaySummary {
                    id: p.id,
                    created_at: p.created_at,
                    mode: p.mode,
                    draw_id: p.draw_id,
                    has_signature: p.signature.is_some(),
                    signer_fingerprint: p.signer_fingerprint,
                })
                .collect(),
        })
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    /// Load the chain for writing. Unreadable data is never overwritten.
    async fn ensure_chain(&self, state: &mut WriteState) -> Result<(), LedgerError> {
        if state.chain.is_some() {
            return Ok(());
        }

        let ciphertext = self.inner.store.get(LEDGER_CIPHERTEXT_KEY)?;
        let digest = self.inner.store.get(LEDGER_DIGEST_KEY)?;
        let entries = match self.decrypt_entries(ciphertext, digest).await {
            Ok(entries) => entries,
            Err(LedgerError::Integrity(failure)) => {
                self.report_integrity(failure, None).await;
                return Err(LedgerError::Integrity(failure));
            }
            Err(e) => return Err(e),
        };

        if !self.inner.channel.validate_chain_now(&entries).await? {
            let fault = HashChain::find_fault(&entries);
            self.report_integrity(IntegrityFailure::BrokenChain, fault).await;
            return Err(LedgerError::Integrity(IntegrityFailure::BrokenChain));
        }

        debug!(len = entries.len(), "loaded chain for writing");
        let mut chain = HashChain::new();
        chain.load(entries);
        state.chain = Some(chain);
        Ok(())
    }

    /// Decrypt persisted records and check the digest.
    async fn decrypt_entries(
        &self,
        ciphertext: Option<String>,
        digest: Option<String>,
    ) -> Result<Vec<Entry>, LedgerError> {
        let Some(raw) = ciphertext else {
            return Ok(Vec::new());
        };

        let blob: EncryptedBlob = serde_json::from_str(&raw)
            .map_err(|_| LedgerError::Integrity(IntegrityFailure::Undecryptable))?;
        let entries: Vec<Entry> = self
            .inner
            .channel
            .decrypt(&blob)
            .await?
            .ok_or(LedgerError::Integrity(IntegrityFailure::Undecryptable))?;

        let expected = digest.ok_or(LedgerError::Integrity(IntegrityFailure::MissingDigest))?;
        if self.inner.channel.hash(&entries).await? != expected.trim() {
            return Err(LedgerError::Integrity(IntegrityFailure::DigestMismatch));
        }

        Ok(entries)
    }

    async fn persist(&self, entries: &[Entry]) -> Result<(), LedgerError> {
        let blob = self.inner.channel.encrypt(entries).await?;
        let digest = self.inner.channel.hash(entries).await?;

        save_json(self.inner.store.as_ref(), LEDGER_CIPHERTEXT_KEY, &blob)?;
        self.inner.store.set(LEDGER_DIGEST_KEY, &digest)?;
        debug!(len = entries.len(), epoch = blob.epoch, "persisted chain");

        // Older seeds stay until the next commit if this fails.
        if let Err(e) = self.inner.channel.retire_keys(blob.epoch).await {
            warn!(epoch = blob.epoch, "failed to retire old ledger keys: {}", e);
        }
        Ok(())
    }

    async fn report_integrity(&self, failure: IntegrityFailure, fault: Option<ChainFault>) {
        warn!(%failure, ?fault, "ledger integrity check failed");
        let kind = match failure {
            IntegrityFailure::BrokenChain => AuditKind::SecurityViolation,
            _ => AuditKind::DataCorruption,
        };
        let mut data = json!({ "reason": failure.reason() });
        if let Some(fault) = fault {
            data["index"] = json!(fault.index());
            data["fault"] = json!(fault.to_string());
        }
        self.audit(kind, data).await;
    }

    async fn audit_check(&self, check: &PlayCheck) {
        self.audit(
            AuditKind::PlayChecked,
            json!({
                "id": check.play_id,
                "drawId": check.draw_id,
                "matches": check.matched.len(),
                "winner": check.winner,
            }),
        )
        .await;
    }

    async fn audit(&self, kind: AuditKind, data: serde_json::Value) {
        self.inner.audit.lock().await.record(kind, data);
    }
}

/// Played numbers that were drawn.
fn score(play: &Entry, drawn: &[u8]) -> PlayCheck {
    let matched: Vec<u8> = play
        .numbers
        .iter()
        .copied()
        .filter(|n| drawn.contains(n))
        .collect();
    PlayCheck {
        play_id: play.id,
        draw_id: play.draw_id,
        winner: matched.len() >= WINNING_MATCHES,
        matched,
    }
}
