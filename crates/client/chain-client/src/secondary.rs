//! Block provider backed by a previously indexed database.
//!
//! Replaying from a finished index is much faster than refetching from a
//! node. Block bodies are archived verbatim in their own table so a later
//! instance can read them back without reconstructing payloads from derived
//! rows.

use crate::{ChainClientError, ChainSource, ChainStatus};
use ap_block::{BlockRange, BlockSource, DbBlock, VirtualOperation};
use ac_db::{Store, Value, WriteBatch};
use std::collections::HashMap;
use std::sync::Arc;

pub const BODIES_TABLE: &str = "block_bodies";

#[derive(Clone)]
pub struct SecondaryDbSource {
    store: Arc<dyn Store>,
}

impl SecondaryDbSource {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Batch archiving block bodies, for instances that feed a secondary.
    pub fn body_batch(blocks: &[DbBlock]) -> Result<WriteBatch, ChainClientError> {
        let mut batch = WriteBatch::upsert(BODIES_TABLE, &["num"], &["num", "body"]);
        for block in blocks {
            batch.push_row(vec![Value::UInt(block.num), Value::Text(serde_json::to_string(block)?)]);
        }
        Ok(batch)
    }
}

#[async_trait::async_trait]
impl ChainSource for SecondaryDbSource {
    async fn block_batch(&self, range: BlockRange) -> Result<Vec<BlockSource>, ChainClientError> {
        let mut conn = self.store.connection().await?;
        let mut blocks = Vec::with_capacity(range.len() as usize);
        for n in range.iter() {
            let row = conn
                .get_row(BODIES_TABLE, &[Value::UInt(n)])
                .await?
                .ok_or(ChainClientError::MissingBlock(n))?;
            let body = row
                .get("body")
                .and_then(Value::as_str)
                .ok_or(ChainClientError::MissingBlock(n))?;
            let block: DbBlock = serde_json::from_str(body)?;
            blocks.push(BlockSource::Db(block));
        }
        Ok(blocks)
    }

    async fn virtual_ops(
        &self,
        _range: BlockRange,
    ) -> Result<HashMap<u64, Vec<VirtualOperation>>, ChainClientError> {
        // Archived bodies embed their virtual operations.
        Ok(HashMap::new())
    }

    async fn status(&self) -> Result<ChainStatus, ChainClientError> {
        let mut conn = self.store.connection().await?;
        let head = conn.latest_block().await?.map(|b| b.number).unwrap_or(0);
        Ok(ChainStatus { head_block: head, last_irreversible: head })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ac_db::MemStore;

    fn body(num: u64) -> DbBlock {
        DbBlock {
            num,
            hash: format!("h{num}"),
            prev_hash: format!("h{}", num - 1),
            timestamp: "2016-01-01T00:00:00".into(),
            transactions: vec![],
            virtual_ops: vec![],
        }
    }

    #[tokio::test]
    async fn reads_back_archived_bodies() {
        let store = MemStore::default();
        let mut conn = store.connection().await.unwrap();
        conn.apply(&SecondaryDbSource::body_batch(&[body(1), body(2)]).unwrap()).await.unwrap();

        let source = SecondaryDbSource::new(Arc::new(store));
        let blocks = source.block_batch(BlockRange::new(1, 2)).await.unwrap();
        assert_eq!(blocks[1].hash(), "h2");
        assert_eq!(blocks[1].previous_hash(), blocks[0].hash());
    }

    #[tokio::test]
    async fn missing_body_is_an_error() {
        let source = SecondaryDbSource::new(Arc::new(MemStore::default()));
        let err = source.block_batch(BlockRange::single(9)).await.unwrap_err();
        assert_matches::assert_matches!(err, ChainClientError::MissingBlock(9));
    }
}
