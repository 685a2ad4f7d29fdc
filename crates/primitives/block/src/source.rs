//! Block providers as a closed sum type.
//!
//! A block can come from a live node, a secondary database, a mock file, or a
//! mock overlay merged onto a real block. [`BlockSource`] makes that set
//! closed: every consumer matches on the same four shapes and gets uniform
//! accessors for number, hash, parent link, timestamp and payloads.

use crate::{BlockRef, Transaction, VirtualOperation};
use serde::{Deserialize, Serialize};

/// A block as returned by a node RPC endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeBlock {
    pub block_num: u64,
    pub block_id: String,
    pub previous: String,
    pub timestamp: String,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    /// Attached by the fetch stage, not part of the RPC block body.
    #[serde(default)]
    pub virtual_ops: Vec<VirtualOperation>,
}

/// A block row read back from a secondary database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbBlock {
    pub num: u64,
    pub hash: String,
    pub prev_hash: String,
    pub timestamp: String,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub virtual_ops: Vec<VirtualOperation>,
}

/// A hand-written block from a mock data file. Missing fields are synthesized
/// so test chains stay well-linked without spelling out every hash.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MockBlock {
    pub block_num: u64,
    #[serde(default)]
    pub block_id: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub virtual_ops: Vec<VirtualOperation>,
}

impl MockBlock {
    /// Deterministic hash for synthesized mock blocks.
    pub fn synthetic_hash(block_num: u64) -> String {
        format!("{block_num:08x}{:032x}", u128::from(block_num))
    }

    pub fn hash(&self) -> String {
        self.block_id.clone().unwrap_or_else(|| Self::synthetic_hash(self.block_num))
    }

    pub fn previous_hash(&self) -> String {
        self.previous.clone().unwrap_or_else(|| Self::synthetic_hash(self.block_num.saturating_sub(1)))
    }
}

/// The closed set of places a block can come from.
#[derive(Clone, Debug, PartialEq)]
pub enum BlockSource {
    Node(NodeBlock),
    Db(DbBlock),
    Mock(MockBlock),
    /// A real block with mock transactions and virtual ops appended.
    Merged { base: Box<BlockSource>, overlay: MockBlock },
}

impl BlockSource {
    pub fn number(&self) -> u64 {
        match self {
            BlockSource::Node(b) => b.block_num,
            BlockSource::Db(b) => b.num,
            BlockSource::Mock(b) => b.block_num,
            BlockSource::Merged { base, .. } => base.number(),
        }
    }

    pub fn hash(&self) -> String {
        match self {
            BlockSource::Node(b) => b.block_id.clone(),
            BlockSource::Db(b) => b.hash.clone(),
            BlockSource::Mock(b) => b.hash(),
            BlockSource::Merged { base, .. } => base.hash(),
        }
    }

    pub fn previous_hash(&self) -> String {
        match self {
            BlockSource::Node(b) => b.previous.clone(),
            BlockSource::Db(b) => b.prev_hash.clone(),
            BlockSource::Mock(b) => b.previous_hash(),
            BlockSource::Merged { base, .. } => base.previous_hash(),
        }
    }

    pub fn timestamp(&self) -> String {
        match self {
            BlockSource::Node(b) => b.timestamp.clone(),
            BlockSource::Db(b) => b.timestamp.clone(),
            BlockSource::Mock(b) => b.timestamp.clone().unwrap_or_else(|| "1970-01-01T00:00:00".into()),
            BlockSource::Merged { base, .. } => base.timestamp(),
        }
    }

    pub fn transactions(&self) -> Box<dyn Iterator<Item = &Transaction> + '_> {
        match self {
            BlockSource::Node(b) => Box::new(b.transactions.iter()),
            BlockSource::Db(b) => Box::new(b.transactions.iter()),
            BlockSource::Mock(b) => Box::new(b.transactions.iter()),
            BlockSource::Merged { base, overlay } => {
                Box::new(base.transactions().chain(overlay.transactions.iter()))
            }
        }
    }

    pub fn virtual_operations(&self) -> Box<dyn Iterator<Item = &VirtualOperation> + '_> {
        match self {
            BlockSource::Node(b) => Box::new(b.virtual_ops.iter()),
            BlockSource::Db(b) => Box::new(b.virtual_ops.iter()),
            BlockSource::Mock(b) => Box::new(b.virtual_ops.iter()),
            BlockSource::Merged { base, overlay } => {
                Box::new(base.virtual_operations().chain(overlay.virtual_ops.iter()))
            }
        }
    }

    pub fn tx_count(&self) -> usize {
        self.transactions().count()
    }

    pub fn op_count(&self) -> usize {
        self.transactions().map(|tx| tx.operations.len()).sum()
    }

    pub fn block_ref(&self) -> BlockRef {
        BlockRef { number: self.number(), hash: self.hash() }
    }

    /// Append a mock overlay's payloads to this block. The base keeps its
    /// number, hash and timestamp; only payloads are extended.
    pub fn merge(self, overlay: MockBlock) -> BlockSource {
        BlockSource::Merged { base: Box::new(self), overlay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Operation;
    use serde_json::json;

    fn node_block(n: u64) -> NodeBlock {
        NodeBlock {
            block_num: n,
            block_id: format!("h{n}"),
            previous: format!("h{}", n - 1),
            timestamp: "2016-03-24T16:05:00".into(),
            transactions: vec![Transaction {
                operations: vec![Operation { ty: "vote".into(), value: json!({}) }],
            }],
            virtual_ops: vec![],
        }
    }

    #[test]
    fn merged_block_keeps_base_identity_and_extends_payloads() {
        let overlay = MockBlock {
            block_num: 5,
            transactions: vec![Transaction {
                operations: vec![Operation { ty: "custom_json".into(), value: json!({}) }],
            }],
            ..Default::default()
        };
        let merged = BlockSource::Node(node_block(5)).merge(overlay);

        assert_eq!(merged.number(), 5);
        assert_eq!(merged.hash(), "h5");
        assert_eq!(merged.tx_count(), 2);
        assert_eq!(merged.op_count(), 2);
    }

    #[test]
    fn mock_blocks_synthesize_linked_hashes() {
        let a = MockBlock { block_num: 10, ..Default::default() };
        let b = MockBlock { block_num: 11, ..Default::default() };
        assert_eq!(b.previous_hash(), a.hash());
    }
}
