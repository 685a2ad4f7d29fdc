//! Block providers for the sync pipeline.
//!
//! Every provider implements [`ChainSource`]: ranged block fetches, ranged
//! virtual operation fetches, and head queries. The pipeline does not care
//! whether blocks come from a live node, a previously indexed database, or a
//! mock data file.

use ap_block::{BlockRange, BlockSource, VirtualOperation};
use std::collections::HashMap;

mod mock;
mod node;
mod secondary;

pub use mock::{MockBlocks, MockSource};
pub use node::{NodeClient, NodeClientConfig};
pub use secondary::SecondaryDbSource;

#[derive(thiserror::Error, Debug)]
pub enum ChainClientError {
    #[error("Transport error: {0:#}")]
    Transport(#[from] reqwest::Error),
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Block {0} is missing from the response")]
    MissingBlock(u64),
    #[error("Malformed response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Mock data error: {0}")]
    MockData(String),
    #[error("Secondary database error: {0:#}")]
    Secondary(#[from] ac_db::StorageError),
    #[error("Exhausted {0} retries")]
    RetriesExhausted(usize),
}

/// Head state reported by a provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainStatus {
    pub head_block: u64,
    pub last_irreversible: u64,
}

/// A provider of chain blocks.
///
/// `block_batch` returns exactly one block per number in the range, in
/// ascending order. `virtual_ops` is separate because node APIs serve them
/// from a different endpoint; providers that embed virtual operations in
/// their blocks return an empty map.
#[async_trait::async_trait]
pub trait ChainSource: Send + Sync {
    async fn block_batch(&self, range: BlockRange) -> Result<Vec<BlockSource>, ChainClientError>;

    async fn virtual_ops(
        &self,
        range: BlockRange,
    ) -> Result<HashMap<u64, Vec<VirtualOperation>>, ChainClientError>;

    async fn status(&self) -> Result<ChainStatus, ChainClientError>;
}
