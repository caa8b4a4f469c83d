//! # Play Ledger
//!
//! Local secure ledger of lottery plays: append-only, hash-chained,
//! encrypted at rest and signed per entry, with replay protection and
//! write rate limiting.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       PLAY LEDGER                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/              - Primitives                             │
//! │  ├── hash.rs        - Canonical JSON + SHA-256 digests       │
//! │  └── clock.rs       - Injectable wall clock                  │
//! │                                                              │
//! │  ledger/            - Data model                             │
//! │  ├── entry.rs       - Play entries, modes, number rules      │
//! │  └── chain.rs       - Append-only hash chain                 │
//! │                                                              │
//! │  security/          - Guards                                 │
//! │  ├── signature.rs   - Ed25519 entry signatures               │
//! │  ├── replay.rs      - Single-use write tokens                │
//! │  ├── rate_limit.rs  - Sliding-window write limit             │
//! │  └── audit.rs       - Audit trail                            │
//! │                                                              │
//! │  offload/           - Crypto worker (separate thread)        │
//! │  ├── protocol.rs    - Request/response messages              │
//! │  ├── keys.rs        - Key schedule + AEAD                    │
//! │  ├── worker.rs      - Responder loop                         │
//! │  └── channel.rs     - Correlation, timeout, debounce         │
//! │                                                              │
//! │  storage.rs         - Key-value persistence                  │
//! │  config.rs          - Limits and timings                     │
//! │  service.rs         - LedgerService orchestrator             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threat Model
//!
//! One writer on one device. The key material lives next to the data, so
//! the ledger detects casual tampering and accidental corruption; it does
//! not resist someone who controls both the code and the storage.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod ledger;
pub mod offload;
pub mod security;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use crate::config::LedgerConfig;
pub use crate::core::clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use crate::ledger::{Entry, HashChain, PlayMode};
pub use crate::service::{AuditExport, LedgerError, LedgerService, PlayCheck};
pub use crate::storage::{FileStore, KeyValueStore, MemoryStore, SharedStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
