//! Replay Protection
//!
//! Every write is admitted under a single-use token
//! `{timestamp, nonce, session_id}`. Nonces have the shape
//! `<session>-<timestamp_ms>-<random>`, so the session and issue time can be
//! recovered from the nonce alone.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::clock::SharedClock;
use crate::storage::{load_json, save_json, SharedStore, REPLAY_NONCES_KEY};

/// Replay guard limits.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Maximum distance between a token's timestamp and now.
    pub tolerance: Duration,
    /// Session lifetime.
    pub session_ttl: Duration,
    /// Consumed nonces kept before the oldest are evicted.
    pub max_nonces: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            tolerance: Duration::from_secs(5 * 60),
            session_ttl: Duration::from_secs(60 * 60),
            max_nonces: 1000,
        }
    }
}

/// Single-use write token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayToken {
    /// Issue time (Unix ms).
    pub timestamp: u64,
    /// Single-use nonce.
    pub nonce: String,
    /// Session that issued the token.
    pub session_id: String,
}

/// Why a token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayRejection {
    /// Token timestamp too far from now.
    #[error("timestamp out of range (skew {skew_ms} ms)")]
    TimestampOutOfRange {
        /// Absolute distance from now.
        skew_ms: u64,
    },
    /// Nonce was consumed before.
    #[error("nonce already used")]
    NonceAlreadyUsed,
    /// Nonce was not issued by the current session.
    #[error("invalid session")]
    InvalidSession,
}

#[derive(Debug, Clone)]
struct Session {
    id: String,
    created_at: u64,
}

/// Issues and validates replay tokens.
pub struct ReplayGuard {
    config: ReplayConfig,
    clock: SharedClock,
    store: SharedStore,
    session: Option<Session>,
    consumed: VecDeque<String>,
    consumed_set: HashSet<String>,
}

impl ReplayGuard {
    /// Create a guard, restoring consumed nonces from the store.
    ///
    /// An unreadable nonce record is discarded.
    pub fn new(config: ReplayConfig, clock: SharedClock, store: SharedStore) -> Self {
        let consumed: VecDeque<String> = match load_json::<Vec<String>>(store.as_ref(), REPLAY_NONCES_KEY) {
            Ok(Some(nonces)) => nonces.into(),
            Ok(None) => VecDeque::new(),
            Err(e) => {
                warn!("discarding unreadable replay nonces: {}", e);
                VecDeque::new()
            }
        };
        let consumed_set = consumed.iter().cloned().collect();

        Self {
            config,
            clock,
            store,
            session: None,
            consumed,
            consumed_set,
        }
    }

    /// Current session id, creating or renewing the session if needed.
    pub fn session_id(&mut self) -> String {
        let now = self.clock.now_millis();
        let ttl = self.config.session_ttl.as_millis() as u64;

        let expired = match &self.session {
            Some(s) => now.saturating_sub(s.created_at) >= ttl,
            None => true,
        };
        if expired {
            let id = Uuid::new_v4().simple().to_string();
            debug!(session = %id, "starting replay session");
            self.session = Some(Session { id, created_at: now });
        }

        self.session
            .as_ref()
            .map(|s| s.id.clone())
            .unwrap_or_default()
    }

    /// Issue a fresh token.
    pub fn issue_token(&mut self) -> ReplayToken {
        let session_id = self.session_id();
        let timestamp = self.clock.now_millis();
        let random = rand::thread_rng().next_u64();

        ReplayToken {
            timestamp,
            nonce: format!("{}-{}-{:016x}", session_id, timestamp, random),
            session_id,
        }
    }

    /// Validate a token and consume its nonce.
    pub fn validate(&mut self, timestamp: u64, nonce: &str) -> Result<(), ReplayRejection> {
        let now = self.clock.now_millis();
        let skew_ms = now.abs_diff(timestamp);
        if skew_ms > self.config.tolerance.as_millis() as u64 {
            return Err(ReplayRejection::TimestampOutOfRange { skew_ms });
        }

        if self.consumed_set.contains(nonce) {
            return Err(ReplayRejection::NonceAlreadyUsed);
        }

        let in_session = self
            .session
            .as_ref()
            .is_some_and(|s| nonce.starts_with(&format!("{}-", s.id)));
        if !in_session {
            return Err(ReplayRejection::InvalidSession);
        }

        self.consumed.push_back(nonce.to_string());
        self.consumed_set.insert(nonce.to_string());
        while self.consumed.len() > self.config.max_nonces {
            if let Some(evicted) = self.consumed.pop_front() {
                self.consumed_set.remove(&evicted);
            }
        }
        self.persist();

        Ok(())
    }

    /// Drop consumed nonces older than `max_age`.
    ///
    /// Nonces without a readable embedded timestamp are dropped too.
    pub fn prune(&mut self, max_age: Duration) {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(max_age.as_millis() as u64);
        let before = self.consumed.len();

        self.consumed
            .retain(|nonce| nonce_timestamp(nonce).is_some_and(|ts| ts > cutoff));
        self.consumed_set = self.consumed.iter().cloned().collect();

        debug!(pruned = before - self.consumed.len(), "pruned replay nonces");
        self.persist();
    }

    /// Number of consumed nonces held.
    pub fn consumed_count(&self) -> usize {
        self.consumed.len()
    }

    fn persist(&self) {
        let nonces: Vec<&String> = self.consumed.iter().collect();
        if let Err(e) = save_json(self.store.as_ref(), REPLAY_NONCES_KEY, &nonces) {
            warn!("failed to persist replay nonces: {}", e);
        }
    }
}

/// Issue time embedded in a nonce.
pub fn nonce_timestamp(nonce: &str) -> Option<u64> {
    nonce.split('-').nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    const T0: u64 = 1_700_000_000_000;

    fn guard_with(config: ReplayConfig) -> (ReplayGuard, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryStore::new());
        let guard = ReplayGuard::new(config, clock.clone(), store.clone());
        (guard, clock, store)
    }

    fn guard() -> (ReplayGuard, Arc<ManualClock>, Arc<MemoryStore>) {
        guard_with(ReplayConfig::default())
    }

    #[test]
    fn test_fresh_token_accepted() {
        let (mut guard, _, _) = guard();
        let token = guard.issue_token();

        assert!(token.nonce.starts_with(&token.session_id));
        assert_eq!(nonce_timestamp(&token.nonce), Some(T0));
        assert_eq!(guard.validate(token.timestamp, &token.nonce), Ok(()));
    }

    #[test]
    fn test_reused_nonce_rejected() {
        let (mut guard, _, _) = guard();
        let token = guard.issue_token();

        guard.validate(token.timestamp, &token.nonce).unwrap();
        assert_eq!(
            guard.validate(token.timestamp, &token.nonce),
            Err(ReplayRejection::NonceAlreadyUsed)
        );
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let (mut guard, clock, _) = guard();
        let token = guard.issue_token();

        clock.advance(Duration::from_secs(5 * 60 + 1));
        assert!(matches!(
            guard.validate(token.timestamp, &token.nonce),
            Err(ReplayRejection::TimestampOutOfRange { .. })
        ));
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let (mut guard, _, _) = guard();
        let token = guard.issue_token();
        let future = T0 + 10 * 60 * 1000;

        assert!(matches!(
            guard.validate(future, &token.nonce),
            Err(ReplayRejection::TimestampOutOfRange { skew_ms }) if skew_ms == 10 * 60 * 1000
        ));
    }

    #[test]
    fn test_foreign_session_rejected() {
        let (mut guard, _, _) = guard();
        guard.issue_token();
        let forged = format!("deadbeef-{}-0000000000000000", T0);

        assert_eq!(guard.validate(T0, &forged), Err(ReplayRejection::InvalidSession));
    }

    #[test]
    fn test_session_renewed_after_ttl() {
        let (mut guard, clock, _) = guard();
        let first = guard.session_id();
        assert_eq!(guard.session_id(), first);

        clock.advance(Duration::from_secs(60 * 60));
        assert_ne!(guard.session_id(), first);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let (mut guard, _, _) = guard_with(ReplayConfig {
            max_nonces: 2,
            ..Default::default()
        });
        let tokens: Vec<_> = (0..3).map(|_| guard.issue_token()).collect();
        for t in &tokens {
            guard.validate(t.timestamp, &t.nonce).unwrap();
        }

        assert_eq!(guard.consumed_count(), 2);
        // The evicted nonce is no longer remembered.
        assert_eq!(guard.validate(tokens[0].timestamp, &tokens[0].nonce), Ok(()));
    }

    #[test]
    fn test_prune_by_embedded_timestamp() {
        let (mut guard, clock, _) = guard();
        let old = guard.issue_token();
        guard.validate(old.timestamp, &old.nonce).unwrap();

        clock.advance(Duration::from_secs(120));
        let recent = guard.issue_token();
        guard.validate(recent.timestamp, &recent.nonce).unwrap();

        guard.prune(Duration::from_secs(60));
        assert_eq!(guard.consumed_count(), 1);
    }

    #[test]
    fn test_consumed_nonces_survive_restart() {
        let (mut guard, clock, store) = guard();
        let token = guard.issue_token();
        guard.validate(token.timestamp, &token.nonce).unwrap();

        let mut restarted = ReplayGuard::new(ReplayConfig::default(), clock, store);
        assert_eq!(restarted.consumed_count(), 1);
        assert_eq!(
            restarted.validate(token.timestamp, &token.nonce),
            Err(ReplayRejection::NonceAlreadyUsed)
        );
    }
}
