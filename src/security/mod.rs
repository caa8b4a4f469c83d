//! Security Services
//!
//! Guards around every ledger write and read:
//! - Entry signatures (Ed25519)
//! - Replay protection (single-use tokens)
//! - Sliding-window rate limiting
//! - Audit trail

pub mod audit;
pub mod rate_limit;
pub mod replay;
pub mod signature;

pub use audit::{AuditEvent, AuditKind, AuditLog};
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimiter};
pub use replay::{ReplayConfig, ReplayGuard, ReplayRejection, ReplayToken};
pub use signature::{SignatureError, SignatureService};
