//! Core primitives.
//!
//! Canonical hashing and the clock every time-dependent component reads.

pub mod clock;
pub mod hash;

// Re-export core types
pub use clock::{Clock, SharedClock};
pub use hash::{canonical_json, digest_hex, Digest256, EncodingError};
