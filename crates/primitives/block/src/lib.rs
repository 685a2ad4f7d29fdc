//! Apiary chain data model.
//!
//! This crate owns the shapes that flow through the ingestion pipeline: the raw
//! wire-level [`Operation`] / [`VirtualOperation`] payloads, their classified
//! counterparts ([`OperationKind`] / [`VirtualOpKind`]), the [`BlockSource`] sum
//! type that normalizes the three possible upstream shapes behind one accessor
//! set, and the [`BlockRange`] interval that is the unit of flush, transaction
//! and fork rollback.

mod operations;
mod source;

pub use operations::*;
pub use source::*;

use serde::{Deserialize, Serialize};

/// Identity of a block in the store: its height and hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: String,
}

/// An inclusive `[first, last]` interval of block numbers, processed as one
/// atomic unit: one flush, one transaction, one fork-recovery rollback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub first: u64,
    pub last: u64,
}

impl BlockRange {
    pub fn new(first: u64, last: u64) -> Self {
        debug_assert!(first <= last, "invalid block range [{first}, {last}]");
        Self { first, last }
    }

    pub fn single(block_n: u64) -> Self {
        Self { first: block_n, last: block_n }
    }

    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    pub fn is_empty(&self) -> bool {
        false // inclusive interval, always at least one block
    }

    pub fn contains(&self, block_n: u64) -> bool {
        self.first <= block_n && block_n <= self.last
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> {
        self.first..=self.last
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}..={}]", self.first, self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_is_inclusive() {
        let range = BlockRange::new(100, 102);
        assert_eq!(range.len(), 3);
        assert!(range.contains(100) && range.contains(102));
        assert!(!range.contains(103));
        assert_eq!(range.iter().collect::<Vec<_>>(), vec![100, 101, 102]);
        assert_eq!(BlockRange::single(7).len(), 1);
    }
}
