//! Mock block provider, backed by a hand-written data file.
//!
//! Used in two roles: as the only provider, for offline runs over fabricated
//! chains, and as an overlay whose transactions get merged onto real blocks.
//! Numbers the file does not mention are synthesized as empty, well-linked
//! blocks, so a file describing blocks 5 and 9 still yields a full chain.

use crate::{ChainClientError, ChainSource, ChainStatus};
use ap_block::{BlockRange, BlockSource, MockBlock, VirtualOperation};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Blocks parsed from a mock data file, keyed by number.
#[derive(Clone, Debug, Default)]
pub struct MockBlocks {
    blocks: BTreeMap<u64, MockBlock>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MockFile {
    Wrapped { blocks: Vec<MockBlock> },
    Bare(Vec<MockBlock>),
}

impl MockBlocks {
    pub fn from_blocks(blocks: impl IntoIterator<Item = MockBlock>) -> Self {
        Self { blocks: blocks.into_iter().map(|b| (b.block_num, b)).collect() }
    }

    /// Accepts JSON, or YAML when the extension says so.
    pub fn load(path: &Path) -> Result<Self, ChainClientError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChainClientError::MockData(format!("cannot read {}: {e}", path.display())))?;
        let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"));
        let file: MockFile = if is_yaml {
            serde_yaml::from_str(&content)
                .map_err(|e| ChainClientError::MockData(format!("{}: {e}", path.display())))?
        } else {
            serde_json::from_str(&content)?
        };
        let blocks = match file {
            MockFile::Wrapped { blocks } | MockFile::Bare(blocks) => blocks,
        };
        Ok(Self::from_blocks(blocks))
    }

    pub fn get(&self, block_n: u64) -> Option<&MockBlock> {
        self.blocks.get(&block_n)
    }

    pub fn max_block(&self) -> Option<u64> {
        self.blocks.keys().next_back().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Standalone mock provider.
#[derive(Clone, Debug)]
pub struct MockSource {
    blocks: MockBlocks,
    head: u64,
}

impl MockSource {
    /// `head` extends the chain past the last file block with synthesized
    /// empty blocks.
    pub fn new(blocks: MockBlocks, head: Option<u64>) -> Self {
        let head = head.unwrap_or(0).max(blocks.max_block().unwrap_or(0));
        Self { blocks, head }
    }

    fn block(&self, block_n: u64) -> MockBlock {
        self.blocks.get(block_n).cloned().unwrap_or(MockBlock { block_num: block_n, ..Default::default() })
    }
}

#[async_trait::async_trait]
impl ChainSource for MockSource {
    async fn block_batch(&self, range: BlockRange) -> Result<Vec<BlockSource>, ChainClientError> {
        // A provider cannot serve blocks past its own head.
        Ok(range.iter().filter(|n| *n <= self.head).map(|n| BlockSource::Mock(self.block(n))).collect())
    }

    async fn virtual_ops(
        &self,
        _range: BlockRange,
    ) -> Result<HashMap<u64, Vec<VirtualOperation>>, ChainClientError> {
        // Mock blocks embed their virtual operations.
        Ok(HashMap::new())
    }

    async fn status(&self) -> Result<ChainStatus, ChainClientError> {
        // A fabricated chain has no reversible tail.
        Ok(ChainStatus { head_block: self.head, last_irreversible: self.head })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn synthesizes_gaps_into_a_linked_chain() {
        let blocks = MockBlocks::from_blocks([MockBlock { block_num: 5, ..Default::default() }]);
        let source = MockSource::new(blocks, Some(8));

        let batch = source.block_batch(BlockRange::new(4, 8)).await.unwrap();
        assert_eq!(batch.len(), 5);
        for pair in batch.windows(2) {
            assert_eq!(pair[1].previous_hash(), pair[0].hash());
        }
        assert_eq!(source.status().await.unwrap().head_block, 8);
    }

    #[test]
    fn loads_a_bare_json_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.json");
        std::fs::write(&path, r#"[{"block_num": 3}, {"block_num": 7}]"#).unwrap();

        let blocks = MockBlocks::load(&path).unwrap();
        assert_eq!(blocks.max_block(), Some(7));
        assert!(blocks.get(3).is_some());
    }
}
