//! Fork detection and recovery.
//!
//! The guard keeps a sliding window of the last `depth` accepted block refs.
//! An incoming block whose parent hash does not extend the window is a fork:
//! a micro fork when the divergence point is still inside the window (those
//! blocks are unflushed, rewinding is a cache operation), a deep fork when it
//! is below the window (flushed rows have to be popped from the store).

use ac_db::{StorageError, StoreConnection};
use ac_chain_client::{ChainClientError, ChainSource};
use ap_block::{BlockRange, BlockRef, BlockSource};
use std::collections::VecDeque;

pub const DEFAULT_FORK_WINDOW: usize = 32;
pub const DEFAULT_SANITY_DEPTH: u64 = 400;

#[derive(thiserror::Error, Debug)]
pub enum ForkError {
    #[error("Micro fork at block {block_n}, rewinding to {fork_point}")]
    Micro { block_n: u64, fork_point: u64 },
    #[error("Deep fork at block {block_n}, divergence is below the unflushed window")]
    Deep { block_n: u64 },
    #[error("No common ancestor found walking back {searched} blocks (floor {floor})")]
    BeyondRecovery { searched: u64, floor: u64 },
}

#[derive(thiserror::Error, Debug)]
pub enum RecoveryError {
    #[error(transparent)]
    Fork(#[from] ForkError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Client(#[from] ChainClientError),
}

pub struct ForkGuard {
    window: VecDeque<BlockRef>,
    depth: usize,
}

impl ForkGuard {
    /// `depth` of zero disables fork checking entirely (mock and secondary
    /// database sources cannot fork).
    pub fn new(depth: usize) -> Self {
        Self { window: VecDeque::new(), depth }
    }

    /// Prime the window with the store head so the first live block gets
    /// checked against it.
    pub fn seed(&mut self, head: Option<BlockRef>) {
        self.window.clear();
        if let Some(head) = head {
            if self.depth > 0 {
                self.window.push_back(head);
            }
        }
    }

    pub fn last(&self) -> Option<&BlockRef> {
        self.window.back()
    }

    /// Accept the block into the window, or classify the fork it reveals.
    pub fn observe(&mut self, block: &BlockSource) -> Result<(), ForkError> {
        if self.depth == 0 {
            return Ok(());
        }
        let block_n = block.number();
        if let Some(tip) = self.window.back() {
            if block.previous_hash() != tip.hash {
                // Walk the window for the parent. Inside: micro. Absent: deep.
                if let Some(parent) = self.window.iter().rev().find(|r| r.hash == block.previous_hash()) {
                    return Err(ForkError::Micro { block_n, fork_point: parent.number });
                }
                return Err(ForkError::Deep { block_n });
            }
        }
        self.window.push_back(block.block_ref());
        while self.window.len() > self.depth {
            self.window.pop_front();
        }
        Ok(())
    }

    /// Drop window entries above the fork point.
    pub fn rewind_to(&mut self, fork_point: u64) {
        self.window.retain(|r| r.number <= fork_point);
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

/// Walk back from `from_block_n` comparing store hashes against the provider
/// until both chains agree. The search stops at the irreversible floor and at
/// the sanity depth; running past either means the provider serves a chain we
/// cannot reconcile with.
pub async fn find_fork_point(
    conn: &mut (dyn StoreConnection + '_),
    source: &dyn ChainSource,
    from_block_n: u64,
    floor: u64,
    sanity_depth: u64,
) -> Result<u64, RecoveryError> {
    let mut block_n = from_block_n;
    let mut searched = 0;
    loop {
        if block_n <= floor || searched >= sanity_depth {
            return Err(ForkError::BeyondRecovery { searched, floor }.into());
        }
        let local = conn.block_hash(block_n).await?;
        let remote = source
            .block_batch(BlockRange::single(block_n))
            .await?
            .pop()
            .ok_or(ChainClientError::MissingBlock(block_n))?
            .hash();
        match local {
            Some(local) if local == remote => {
                tracing::info!("⛓️ Fork point found at block {block_n}");
                return Ok(block_n);
            }
            _ => {
                tracing::debug!("Block {block_n} differs from the provider, walking back");
                block_n -= 1;
                searched += 1;
            }
        }
    }
}
