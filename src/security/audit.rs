//! Audit Trail
//!
//! Append-only record of ledger activity and security events. Unlike the
//! ledger it is neither hash-chained nor signed, and only the most recent
//! `capacity` events are kept.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::core::clock::SharedClock;
use crate::storage::{load_json, save_json, SharedStore, AUDIT_LOG_KEY};

/// Audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A play was recorded.
    PlayCreated,
    /// A play was checked against a draw result.
    PlayChecked,
    /// Rate limit, replay, signature or deletion violation.
    SecurityViolation,
    /// Persisted data failed decryption, digest or chain checks.
    DataCorruption,
    /// History was cleared.
    HistoryCleared,
}

impl AuditKind {
    /// True for kinds that indicate tampering or abuse.
    pub fn is_security_event(&self) -> bool {
        matches!(self, Self::SecurityViolation | Self::DataCorruption)
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unix ms, strictly increasing.
    pub id: u64,
    /// ISO-8601 time.
    pub timestamp: String,
    /// Event kind.
    pub event: AuditKind,
    /// Context.
    pub data: Value,
}

/// Bounded, persisted audit trail.
pub struct AuditLog {
    clock: SharedClock,
    store: SharedStore,
    capacity: usize,
    events: Vec<AuditEvent>,
}

impl AuditLog {
    /// Open the trail, restoring persisted events. `capacity` is clamped to 1.
    pub fn new(capacity: usize, clock: SharedClock, store: SharedStore) -> Self {
        let events = match load_json::<Vec<AuditEvent>>(store.as_ref(), AUDIT_LOG_KEY) {
            Ok(Some(events)) => events,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("discarding unreadable audit log: {}", e);
                Vec::new()
            }
        };

        Self {
            clock,
            store,
            capacity: capacity.max(1),
            events,
        }
    }

    /// Append an event.
    pub fn record(&mut self, event: AuditKind, data: Value) -> &AuditEvent {
        let now = self.clock.now_millis();
        let id = match self.events.last() {
            Some(last) if last.id >= now => last.id + 1,
            _ => now,
        };

        if event.is_security_event() {
            warn!(audit_id = id, ?event, %data, "security event");
        } else {
            info!(audit_id = id, ?event, %data, "audit");
        }

        self.events.push(AuditEvent {
            id,
            timestamp: self.clock.now_iso8601(),
            event,
            data,
        });
        if self.events.len() > self.capacity {
            let excess = self.events.len() - self.capacity;
            self.events.drain(..excess);
        }

        if let Err(e) = save_json(self.store.as_ref(), AUDIT_LOG_KEY, &self.events) {
            warn!("failed to persist audit log: {}", e);
        }

        &self.events[self.events.len() - 1]
    }

    /// All retained events, oldest first.
    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }
}
