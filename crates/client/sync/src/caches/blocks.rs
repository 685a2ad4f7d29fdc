//! Block rows. The `completed` marker on these rows is the durability anchor
//! of every flush: it is written in the last transaction to commit, so a
//! crash mid-flush leaves rows the startup truncation can identify.

use super::{apply_batches, CacheCore, CacheError, EntityCache};
use ac_db::{StoreConnection, Value, WriteBatch};
use ap_block::BlockSource;
use std::sync::Mutex;

struct BlockRow {
    num: u64,
    hash: String,
    prev_hash: String,
    timestamp: String,
    tx_count: u64,
    op_count: u64,
}

pub struct BlocksCache {
    core: CacheCore,
    rows: Mutex<Vec<BlockRow>>,
}

impl BlocksCache {
    pub fn new() -> Self {
        Self { core: CacheCore::new("blocks"), rows: Mutex::new(vec![]) }
    }

    pub fn register(&self, block: &BlockSource) -> Result<(), CacheError> {
        self.core.check_register()?;
        self.rows.lock().expect("blocks cache lock").push(BlockRow {
            num: block.number(),
            hash: block.hash(),
            prev_hash: block.previous_hash(),
            timestamp: block.timestamp(),
            tx_count: block.tx_count() as u64,
            op_count: block.op_count() as u64,
        });
        Ok(())
    }

    fn build_batch(&self) -> WriteBatch {
        let mut batch = WriteBatch::upsert("blocks", &["num"], &[
            "num",
            "hash",
            "prev_hash",
            "timestamp",
            "tx_count",
            "op_count",
            "completed",
        ]);
        for row in self.rows.lock().expect("blocks cache lock").iter() {
            batch.push_row(vec![
                Value::UInt(row.num),
                Value::Text(row.hash.clone()),
                Value::Text(row.prev_hash.clone()),
                Value::Text(row.timestamp.clone()),
                Value::UInt(row.tx_count),
                Value::UInt(row.op_count),
                Value::Bool(true),
            ]);
        }
        batch
    }
}

impl Default for BlocksCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EntityCache for BlocksCache {
    fn name(&self) -> &'static str {
        self.core.name()
    }

    fn pending(&self) -> usize {
        self.rows.lock().expect("blocks cache lock").len()
    }

    async fn flush(&self, conn: &mut (dyn StoreConnection + '_)) -> Result<u64, CacheError> {
        let _window = self.core.begin_flush()?;
        apply_batches(conn, &[self.build_batch()]).await
    }

    fn mark_flushed(&self) {
        self.rows.lock().expect("blocks cache lock").clear();
    }

    fn discard_from(&self, block_n: u64) {
        self.rows.lock().expect("blocks cache lock").retain(|r| r.num < block_n);
    }

    fn clear(&self) {
        self.mark_flushed();
    }
}
