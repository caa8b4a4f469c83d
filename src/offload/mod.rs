//! Crypto Offload
//!
//! Symmetric encryption, digests and bulk chain validation run on a
//! separate worker thread, reached through a message channel:
//! - [`protocol`]: request/response messages
//! - [`keys`]: derived key schedule and AEAD
//! - [`worker`]: the isolated responder
//! - [`channel`]: caller side with correlation, timeout and debounce

pub mod channel;
pub mod keys;
pub mod protocol;
pub mod worker;

pub use channel::{ChannelConfig, ChannelError, CryptoChannel};
pub use keys::{EpochKey, KeyError, KeySchedule};
pub use protocol::{EncryptedBlob, OffloadRequest, OffloadResponse, Operation};
pub use worker::CryptoWorker;
