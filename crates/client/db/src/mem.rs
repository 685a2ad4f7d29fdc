//! In-memory store backend.
//!
//! Tables live in a shared map guarded by an `RwLock`. Connections stage
//! their writes while a transaction is open and publish them on commit, so
//! uncommitted work is never visible to other connections.

use crate::{BatchAction, ChainHead, Result, Row, StorageError, Store, StoreConnection, Value, WriteBatch};
use ap_block::BlockRef;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

const BLOCKS_TABLE: &str = "blocks";
const BLOCK_NUM_COL: &str = "block_num";

/// Rows keyed by their encoded key columns.
type TableRows = BTreeMap<String, Row>;

#[derive(Default)]
struct Inner {
    tables: HashMap<String, TableRows>,
}

fn encode_key(values: &[Value]) -> String {
    values.iter().map(Value::to_string).collect::<Vec<_>>().join("\u{1f}")
}

impl Inner {
    fn apply(&mut self, batch: &WriteBatch) -> Result<u64> {
        let key_indices = batch.key_indices()?;
        let table = self.tables.entry(batch.table.to_string()).or_default();
        for row in &batch.rows {
            if row.len() != batch.cols.len() {
                return Err(StorageError::RowWidth {
                    table: batch.table.to_string(),
                    expected: batch.cols.len(),
                    got: row.len(),
                });
            }
            let key = encode_key(&key_indices.iter().map(|&i| row[i].clone()).collect::<Vec<_>>());
            match batch.action {
                BatchAction::Upsert => {
                    // Matches `ON CONFLICT DO UPDATE SET`: only the batch
                    // columns change, other columns of an existing row stay.
                    let stored = table.entry(key).or_default();
                    for (col, value) in batch.cols.iter().zip(row.iter()) {
                        stored.insert(col.to_string(), value.clone());
                    }
                }
                BatchAction::Delete => {
                    table.remove(&key);
                }
            }
        }
        Ok(batch.rows.len() as u64)
    }

    /// Rows without a block provenance column (name-keyed dimension tables)
    /// are left in place.
    fn pop_blocks_above(&mut self, number: u64) -> u64 {
        let mut popped = 0;
        for (name, table) in &mut self.tables {
            let col = if name == BLOCKS_TABLE { "num" } else { BLOCK_NUM_COL };
            let is_blocks = name == BLOCKS_TABLE;
            table.retain(|_, row| match row.get(col).and_then(Value::as_u64) {
                Some(n) if n > number => {
                    if is_blocks {
                        popped += 1;
                    }
                    false
                }
                _ => true,
            });
        }
        popped
    }

    fn chain_head(&self) -> ChainHead {
        let mut head = ChainHead::default();
        let Some(blocks) = self.tables.get(BLOCKS_TABLE) else { return head };
        for row in blocks.values() {
            let Some(num) = row.get("num").and_then(Value::as_u64) else { continue };
            if head.latest_present.map_or(true, |p| num > p) {
                head.latest_present = Some(num);
            }
            if row.get("completed").and_then(Value::as_bool) == Some(true)
                && head.latest_completed.as_ref().map_or(true, |b| num > b.number)
            {
                let hash = row.get("hash").and_then(Value::as_str).unwrap_or_default().to_string();
                head.latest_completed = Some(BlockRef { number: num, hash });
            }
        }
        head
    }
}

enum StagedOp {
    Batch(WriteBatch),
    PopAbove(u64),
}

/// Shared in-memory store. Cloning shares the underlying tables.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<RwLock<Inner>>,
    pool_size: usize,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new(8)
    }
}

impl MemStore {
    pub fn new(pool_size: usize) -> Self {
        Self { inner: Arc::new(RwLock::new(Inner::default())), pool_size: pool_size.max(1) }
    }

    /// Committed rows of a table, in key order. Inspection helper for tests
    /// and tooling.
    pub fn table_rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .read()
            .map(|inner| inner.tables.get(table).map(|t| t.values().cloned().collect()).unwrap_or_default())
            .unwrap_or_default()
    }

    fn lock_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| StorageError::InconsistentStorage("store lock poisoned".into()))
    }

    fn lock_read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| StorageError::InconsistentStorage("store lock poisoned".into()))
    }
}

#[async_trait::async_trait]
impl Store for MemStore {
    async fn connection(&self) -> Result<Box<dyn StoreConnection>> {
        Ok(Box::new(MemConnection { store: self.clone(), txn: None }))
    }

    fn pool_size(&self) -> usize {
        self.pool_size
    }
}

pub struct MemConnection {
    store: MemStore,
    txn: Option<Vec<StagedOp>>,
}

#[async_trait::async_trait]
impl StoreConnection for MemConnection {
    async fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(StorageError::NestedTransaction);
        }
        self.txn = Some(vec![]);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let staged = self.txn.take().ok_or(StorageError::NoTransaction)?;
        let mut inner = self.store.lock_write()?;
        for op in staged {
            match op {
                StagedOp::Batch(batch) => {
                    inner.apply(&batch)?;
                }
                StagedOp::PopAbove(n) => {
                    inner.pop_blocks_above(n);
                }
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.txn.take().ok_or(StorageError::NoTransaction)?;
        Ok(())
    }

    async fn apply(&mut self, batch: &WriteBatch) -> Result<u64> {
        // Batch shape errors surface at apply time even when staging.
        batch.key_indices()?;
        match &mut self.txn {
            Some(staged) => {
                let count = batch.rows.len() as u64;
                staged.push(StagedOp::Batch(batch.clone()));
                Ok(count)
            }
            None => self.store.lock_write()?.apply(batch),
        }
    }

    async fn get_row(&mut self, table: &str, key: &[Value]) -> Result<Option<Row>> {
        let inner = self.store.lock_read()?;
        Ok(inner.tables.get(table).and_then(|t| t.get(&encode_key(key))).cloned())
    }

    async fn latest_block(&mut self) -> Result<Option<BlockRef>> {
        Ok(self.store.lock_read()?.chain_head().latest_completed)
    }

    async fn chain_head(&mut self) -> Result<ChainHead> {
        Ok(self.store.lock_read()?.chain_head())
    }

    async fn block_hash(&mut self, number: u64) -> Result<Option<String>> {
        let inner = self.store.lock_read()?;
        Ok(inner
            .tables
            .get(BLOCKS_TABLE)
            .and_then(|t| t.get(&encode_key(&[Value::UInt(number)])))
            .and_then(|row| row.get("hash"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn pop_blocks_above(&mut self, number: u64) -> Result<u64> {
        match &mut self.txn {
            Some(staged) => {
                staged.push(StagedOp::PopAbove(number));
                Ok(0)
            }
            None => Ok(self.store.lock_write()?.pop_blocks_above(number)),
        }
    }

    async fn prune_below(&mut self, table: &str, col: &str, threshold: u64) -> Result<u64> {
        let mut inner = self.store.lock_write()?;
        let Some(rows) = inner.tables.get_mut(table) else { return Ok(0) };
        let before = rows.len();
        rows.retain(|_, row| !matches!(row.get(col).and_then(Value::as_u64), Some(v) if v < threshold));
        Ok((before - rows.len()) as u64)
    }

    async fn truncate_incomplete(&mut self) -> Result<u64> {
        let mut inner = self.store.lock_write()?;
        let floor = inner.chain_head().latest_completed.map(|b| b.number).unwrap_or(0);
        Ok(inner.pop_blocks_above(floor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn block_row(num: u64, completed: bool) -> Vec<Value> {
        vec![
            Value::UInt(num),
            Value::Text(format!("h{num}")),
            Value::Text(format!("h{}", num - 1)),
            Value::Bool(completed),
        ]
    }

    fn blocks_batch(rows: Vec<Vec<Value>>) -> WriteBatch {
        let mut batch = WriteBatch::upsert("blocks", &["num"], &["num", "hash", "prev_hash", "completed"]);
        for row in rows {
            batch.push_row(row);
        }
        batch
    }

    #[tokio::test]
    async fn upsert_is_last_wins_on_key() {
        let store = MemStore::default();
        let mut conn = store.connection().await.unwrap();

        let mut batch = WriteBatch::upsert("accounts", &["name"], &["name", "post_count"]);
        batch.push_row(vec!["alice".into(), Value::UInt(1)]);
        batch.push_row(vec!["alice".into(), Value::UInt(2)]);
        conn.apply(&batch).await.unwrap();
        conn.apply(&batch).await.unwrap();

        let row = conn.get_row("accounts", &["alice".into()]).await.unwrap().unwrap();
        assert_eq!(row.get("post_count"), Some(&Value::UInt(2)));
    }

    #[tokio::test]
    async fn transaction_rollback_discards_staged_writes() {
        let store = MemStore::default();
        let mut conn = store.connection().await.unwrap();

        conn.begin().await.unwrap();
        conn.apply(&blocks_batch(vec![block_row(1, true)])).await.unwrap();
        conn.rollback().await.unwrap();

        assert_eq!(conn.latest_block().await.unwrap(), None);
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible_to_other_connections() {
        let store = MemStore::default();
        let mut writer = store.connection().await.unwrap();
        let mut reader = store.connection().await.unwrap();

        writer.begin().await.unwrap();
        writer.apply(&blocks_batch(vec![block_row(1, true)])).await.unwrap();
        assert_eq!(reader.latest_block().await.unwrap(), None);

        writer.commit().await.unwrap();
        assert_eq!(reader.latest_block().await.unwrap().unwrap().number, 1);
    }

    #[tokio::test]
    async fn pop_blocks_above_removes_blocks_and_derived_rows() {
        let store = MemStore::default();
        let mut conn = store.connection().await.unwrap();

        conn.apply(&blocks_batch(vec![block_row(1, true), block_row(2, true), block_row(3, true)]))
            .await
            .unwrap();
        let mut votes = WriteBatch::upsert("votes", &["voter", "author", "permlink"], &[
            "voter", "author", "permlink", "block_num",
        ]);
        votes.push_row(vec!["a".into(), "b".into(), "p1".into(), Value::UInt(2)]);
        votes.push_row(vec!["a".into(), "b".into(), "p2".into(), Value::UInt(3)]);
        conn.apply(&votes).await.unwrap();

        let popped = conn.pop_blocks_above(1).await.unwrap();
        assert_eq!(popped, 2);
        assert_eq!(conn.latest_block().await.unwrap().unwrap().number, 1);
        assert!(conn.get_row("votes", &["a".into(), "b".into(), "p2".into()]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncate_incomplete_drops_back_to_completed_marker() {
        let store = MemStore::default();
        let mut conn = store.connection().await.unwrap();

        conn.apply(&blocks_batch(vec![block_row(1, true), block_row(2, true), block_row(3, false)]))
            .await
            .unwrap();
        assert_eq!(conn.truncate_incomplete().await.unwrap(), 1);
        assert_eq!(conn.chain_head().await.unwrap().latest_present, Some(2));
    }

    #[tokio::test]
    async fn malformed_batch_is_rejected() {
        let store = MemStore::default();
        let mut conn = store.connection().await.unwrap();

        let batch = WriteBatch::upsert("accounts", &["id"], &["name"]);
        assert_matches!(conn.apply(&batch).await, Err(StorageError::MissingKeyColumn { .. }));
    }
}
