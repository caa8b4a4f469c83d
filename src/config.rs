//! Ledger Configuration
//!
//! Limits and timings for every component, with defaults and environment
//! overrides.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::offload::ChannelConfig;
use crate::security::{RateLimitConfig, ReplayConfig};

/// Ledger configuration.
#[derive(Clone, Debug)]
pub struct LedgerConfig {
    /// Directory for the file-backed store.
    pub data_dir: PathBuf,
    /// Writes allowed per rate-limit window.
    pub rate_limit_max: usize,
    /// Rate-limit window.
    pub rate_limit_window: Duration,
    /// Replay timestamp tolerance.
    pub replay_tolerance: Duration,
    /// Replay session lifetime.
    pub session_ttl: Duration,
    /// Consumed nonces kept.
    pub max_nonces: usize,
    /// Consumed nonces older than this are pruned on clear.
    pub nonce_max_age: Duration,
    /// Offload request timeout.
    pub channel_timeout: Duration,
    /// Quiet period for chain validation.
    pub validate_debounce: Duration,
    /// Encryptions per derived key before reseeding.
    pub max_operations_per_key: u64,
    /// Audit events kept.
    pub audit_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            rate_limit_max: 3,
            rate_limit_window: Duration::from_secs(60),
            replay_tolerance: Duration::from_secs(5 * 60),
            session_ttl: Duration::from_secs(60 * 60),
            max_nonces: 1000,
            nonce_max_age: Duration::from_secs(24 * 60 * 60),
            channel_timeout: Duration::from_secs(30),
            validate_debounce: Duration::from_millis(1000),
            max_operations_per_key: 50,
            audit_capacity: 100,
        }
    }
}

impl LedgerConfig {
    /// Create config from environment variables. Unset or malformed values
    /// keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("PLAY_LEDGER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            rate_limit_max: env_parse("PLAY_LEDGER_RATE_MAX").unwrap_or(defaults.rate_limit_max),
            rate_limit_window: env_parse("PLAY_LEDGER_RATE_WINDOW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_window),
            replay_tolerance: env_parse("PLAY_LEDGER_REPLAY_TOLERANCE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.replay_tolerance),
            session_ttl: env_parse("PLAY_LEDGER_SESSION_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_ttl),
            channel_timeout: env_parse("PLAY_LEDGER_CHANNEL_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.channel_timeout),
            validate_debounce: env_parse("PLAY_LEDGER_DEBOUNCE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.validate_debounce),
            max_operations_per_key: env_parse("PLAY_LEDGER_KEY_ROTATION_OPS")
                .unwrap_or(defaults.max_operations_per_key),
            ..defaults
        }
    }

    /// Rate limiter settings.
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_per_window: self.rate_limit_max,
            window: self.rate_limit_window,
        }
    }

    /// Replay guard settings.
    pub fn replay(&self) -> ReplayConfig {
        ReplayConfig {
            tolerance: self.replay_tolerance,
            session_ttl: self.session_ttl,
            max_nonces: self.max_nonces,
        }
    }

    /// Offload channel settings.
    pub fn channel(&self) -> ChannelConfig {
        ChannelConfig {
            timeout: self.channel_timeout,
            debounce: self.validate_debounce,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.rate_limit_max, 3);
        assert_eq!(config.replay().tolerance, Duration::from_secs(300));
        assert_eq!(config.channel().timeout, Duration::from_secs(30));
        assert_eq!(config.channel().debounce, Duration::from_secs(1));
        assert_eq!(config.max_operations_per_key, 50);
    }

    // Single test so env mutation does not race other tests.
    #[test]
    fn test_from_env_overrides_and_fallbacks() {
        std::env::set_var("PLAY_LEDGER_RATE_MAX", "5");
        std::env::set_var("PLAY_LEDGER_DEBOUNCE_MS", "250");
        std::env::set_var("PLAY_LEDGER_KEY_ROTATION_OPS", "ten");

        let config = LedgerConfig::from_env();
        assert_eq!(config.rate_limit().max_per_window, 5);
        assert_eq!(config.validate_debounce, Duration::from_millis(250));
        assert_eq!(config.max_operations_per_key, 50);

        std::env::remove_var("PLAY_LEDGER_RATE_MAX");
        std::env::remove_var("PLAY_LEDGER_DEBOUNCE_MS");
        std::env::remove_var("PLAY_LEDGER_KEY_ROTATION_OPS");
    }
}
