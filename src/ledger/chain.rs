//! Hash-Chain Ledger
//!
//! In-memory, append-only sequence of entries. Each entry embeds the block
//! hash of its predecessor, so editing any entry breaks every later link.
//!
//! ```text
//!   [0] prev="0"      ─┐
//!       hash=H0        │
//!   [1] prev=H0   ◄────┘─┐
//!       hash=H1          │
//!   [2] prev=H1   ◄──────┘
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::hash::EncodingError;
use crate::ledger::entry::{Entry, EntryDraft, GENESIS_HASH};

/// First defect found while scanning a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainFault {
    /// Stored `block_hash` differs from the recomputed one.
    BlockHash {
        /// Entry position.
        index: usize,
    },
    /// `previous_hash` does not match the predecessor (or genesis).
    BrokenLink {
        /// Entry position.
        index: usize,
    },
    /// Stored `index` differs from the position.
    IndexMismatch {
        /// Entry position.
        index: usize,
    },
}

impl ChainFault {
    /// Position of the faulty entry.
    pub fn index(&self) -> usize {
        match self {
            Self::BlockHash { index } | Self::BrokenLink { index } | Self::IndexMismatch { index } => {
                *index
            }
        }
    }
}

impl std::fmt::Display for ChainFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlockHash { index } => write!(f, "block hash mismatch at entry {}", index),
            Self::BrokenLink { index } => write!(f, "broken chain link at entry {}", index),
            Self::IndexMismatch { index } => write!(f, "index mismatch at entry {}", index),
        }
    }
}

/// Attempt to remove an entry from the append-only chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ledger is append-only: entry {0} cannot be removed")]
pub struct AppendOnlyViolation(pub u64);

/// Check a single position of a chain.
///
/// Scanning every position in order with this function is exactly
/// [`HashChain::verify_chain`].
pub fn check_entry(entries: &[Entry], i: usize) -> Option<ChainFault> {
    let entry = &entries[i];

    match entry.compute_block_hash() {
        Ok(hash) if hash == entry.block_hash => {}
        _ => return Some(ChainFault::BlockHash { index: i }),
    }

    let expected_prev = if i == 0 {
        GENESIS_HASH
    } else {
        entries[i - 1].block_hash.as_str()
    };
    if entry.previous_hash != expected_prev {
        return Some(ChainFault::BrokenLink { index: i });
    }

    if entry.index != i as u64 {
        return Some(ChainFault::IndexMismatch { index: i });
    }

    None
}

/// The append-only chain.
#[derive(Debug, Clone, Default)]
pub struct HashChain {
    entries: Vec<Entry>,
}

impl HashChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in append order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Most recent entry.
    pub fn tail(&self) -> Option<&Entry> {
        self.entries.last()
    }

    /// Link a draft onto the tail and return the finalized entry.
    pub fn append(&mut self, draft: EntryDraft) -> Result<Entry, EncodingError> {
        let previous_hash = self
            .tail()
            .map(|e| e.block_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let entry = draft.link(previous_hash, self.entries.len() as u64)?;
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Removal is never performed.
    pub fn remove(&mut self, id: u64) -> Result<(), AppendOnlyViolation> {
        Err(AppendOnlyViolation(id))
    }

    /// Replace the in-memory state verbatim. No validation.
    pub fn load(&mut self, entries: Vec<Entry>) {
        self.entries = entries;
    }

    /// Verify hashes and linkage of this chain.
    pub fn verify(&self) -> bool {
        Self::verify_chain(&self.entries)
    }

    /// Verify hashes and linkage. Empty and single-entry chains are checked
    /// the same way as longer ones.
    pub fn verify_chain(entries: &[Entry]) -> bool {
        Self::find_fault(entries).is_none()
    }

    /// First fault in the chain, for diagnostics.
    pub fn find_fault(entries: &[Entry]) -> Option<ChainFault> {
        (0..entries.len()).find_map(|i| check_entry(entries, i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::entry::tests::draft;
    use crate::ledger::entry::PlayMode;
    use proptest::prelude::*;

    fn build_chain(n: u64) -> HashChain {
        let mut chain = HashChain::new();
        for i in 0..n {
            chain.append(draft(1_000 + i, [1, 2, 3, 4, 5, (6 + i % 30) as u8])).unwrap();
        }
        chain
    }

    #[test]
    fn test_empty_and_single_chain_valid() {
        assert!(HashChain::verify_chain(&[]));
        assert!(build_chain(1).verify());
    }

    #[test]
    fn test_append_links_sequentially() {
        let chain = build_chain(5);
        let entries = chain.entries();

        assert_eq!(entries[0].previous_hash, GENESIS_HASH);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.index, i as u64);
            if i > 0 {
                assert_eq!(entry.previous_hash, entries[i - 1].block_hash);
            }
        }
        assert!(chain.verify());
    }

    #[test]
    fn test_tampered_numbers_detected() {
        let mut entries = build_chain(3).entries().to_vec();
        entries[1].numbers[0] = 44;
        assert_eq!(
            HashChain::find_fault(&entries),
            Some(ChainFault::BlockHash { index: 1 })
        );
    }

    #[test]
    fn test_broken_link_detected() {
        let mut entries = build_chain(4).entries().to_vec();
        // Rehash entry 2 over a forged link so only the link is wrong.
        entries[2].previous_hash = "forged".into();
        entries[2].block_hash = entries[2].compute_block_hash().unwrap();

        assert_eq!(
            HashChain::find_fault(&entries),
            Some(ChainFault::BrokenLink { index: 2 })
        );
        assert!(!HashChain::verify_chain(&entries));
    }

    #[test]
    fn test_genesis_link_checked() {
        let mut entries = build_chain(1).entries().to_vec();
        entries[0].previous_hash = "not-genesis".into();
        entries[0].block_hash = entries[0].compute_block_hash().unwrap();
        assert_eq!(
            HashChain::find_fault(&entries),
            Some(ChainFault::BrokenLink { index: 0 })
        );
    }

    #[test]
    fn test_removed_entry_detected() {
        let mut entries = build_chain(4).entries().to_vec();
        entries.remove(1);
        assert_eq!(HashChain::find_fault(&entries).map(|f| f.index()), Some(1));
    }

    #[test]
    fn test_remove_always_rejected() {
        let mut chain = build_chain(2);
        let id = chain.entries()[0].id;
        assert_eq!(chain.remove(id), Err(AppendOnlyViolation(id)));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_load_replaces_without_validation() {
        let mut entries = build_chain(2).entries().to_vec();
        entries[0].block_hash = "garbage".into();

        let mut chain = build_chain(5);
        chain.load(entries);
        assert_eq!(chain.len(), 2);
        assert!(!chain.verify());
    }

    proptest! {
        #[test]
        fn prop_appended_chain_verifies(
            plays in prop::collection::vec((0u8..46, 0u8..4), 0..12),
        ) {
            let mut chain = HashChain::new();
            for (i, (n, mode)) in plays.iter().enumerate() {
                let mut d = draft(10_000 + i as u64, [*n, 0, 0, 0, 0, 0]);
                d.mode = match mode {
                    0 => PlayMode::Standard,
                    1 => PlayMode::SecondChance,
                    2 => PlayMode::Rematch,
                    _ => PlayMode::AlwaysWins,
                };
                let entry = chain.append(d).unwrap();
                prop_assert_eq!(entry.index, i as u64);
            }
            prop_assert!(chain.verify());
        }

        #[test]
        fn prop_single_field_mutation_detected(
            len in 1u64..8,
            target in 0usize..8,
            field in 0usize..7,
        ) {
            let mut entries = build_chain(len).entries().to_vec();
            let target = target % entries.len();
            let entry = &mut entries[target];
            match field {
                0 => entry.id += 1,
                1 => entry.created_at.push('Z'),
                2 => entry.numbers[0] = entry.numbers[0].wrapping_add(1),
                3 => entry.mode = PlayMode::AlwaysWins,
                4 => entry.request_timestamp += 1,
                5 => entry.previous_hash.push('0'),
                _ => entry.block_hash.push('0'),
            }
            prop_assert!(!HashChain::verify_chain(&entries));
        }
    }
}
