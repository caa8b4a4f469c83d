//! Write Rate Limiting
//!
//! Sliding window over the timestamps of recent writes.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::warn;

use crate::core::clock::SharedClock;
use crate::storage::{load_json, save_json, SharedStore, RATE_LIMIT_KEY};

/// Rate limit settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Writes allowed per window.
    pub max_per_window: usize,
    /// Trailing window length.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 3,
            window: Duration::from_secs(60),
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Write allowed and recorded.
    Allowed,
    /// Write denied.
    Denied {
        /// Whole seconds until the oldest write leaves the window (at least 1).
        retry_after_secs: u64,
    },
}

impl RateDecision {
    /// True if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Sliding-window limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: SharedClock,
    store: SharedStore,
    recent: VecDeque<u64>,
}

impl RateLimiter {
    /// Create a limiter, restoring the window from the store.
    pub fn new(config: RateLimitConfig, clock: SharedClock, store: SharedStore) -> Self {
        let recent = match load_json::<Vec<u64>>(store.as_ref(), RATE_LIMIT_KEY) {
            Ok(Some(stamps)) => stamps.into(),
            Ok(None) => VecDeque::new(),
            Err(e) => {
                warn!("discarding unreadable rate-limit window: {}", e);
                VecDeque::new()
            }
        };

        Self {
            config,
            clock,
            store,
            recent,
        }
    }

    /// Check and, if allowed, record a write.
    pub fn check(&mut self) -> RateDecision {
        let now = self.clock.now_millis();
        let window = self.config.window.as_millis() as u64;

        self.recent.retain(|ts| now.saturating_sub(*ts) < window);

        if self.recent.len() >= self.config.max_per_window {
            let oldest = self.recent.front().copied().unwrap_or(now);
            let remaining_ms = (oldest + window).saturating_sub(now);
            return RateDecision::Denied {
                retry_after_secs: remaining_ms.div_ceil(1000).max(1),
            };
        }

        self.recent.push_back(now);
        let stamps: Vec<u64> = self.recent.iter().copied().collect();
        if let Err(e) = save_json(self.store.as_ref(), RATE_LIMIT_KEY, &stamps) {
            warn!("failed to persist rate-limit window: {}", e);
        }

        RateDecision::Allowed
    }

    /// Writes currently inside the window.
    pub fn in_window(&self) -> usize {
        let now = self.clock.now_millis();
        let window = self.config.window.as_millis() as u64;
        self.recent
            .iter()
            .filter(|ts| now.saturating_sub(**ts) < window)
            .count()
    }
}
