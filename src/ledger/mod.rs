//! Ledger Data Model
//!
//! Play entries and the hash chain that links them.

pub mod chain;
pub mod entry;

pub use chain::{check_entry, AppendOnlyViolation, ChainFault, HashChain};
pub use entry::{
    validate_numbers, Entry, EntryDraft, NumberRule, PlayMode, ValidationError, GENESIS_HASH,
};
