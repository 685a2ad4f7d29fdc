//! Flush coordination.
//!
//! Live mode wraps every cache in one transaction on one connection. Bulk
//! mode fans independent caches out over their own connections, waits for all
//! of them, flushes dependent caches, and only then starts committing. Block
//! rows commit last: their `completed` marker is what makes the whole range
//! durable, anything committed without it gets truncated at startup.

use crate::caches::{CacheError, CacheRegistry, EntityCache, FlushPhase};
use ac_db::{StorageError, Store, StoreConnection};
use ap_utils::PerfStopwatch;
use std::sync::Arc;
use tokio::task::JoinSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// One transaction, sequential caches. Every block is durable as soon as
    /// its flush returns.
    Live,
    /// Concurrent cache flushes over the connection pool, for massive sync.
    Bulk,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub rows: u64,
    pub block_rows: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum FlushError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Flushed {got} block rows where the range holds {expected}")]
    BlockCountMismatch { expected: u64, got: u64 },
    #[error("Flush worker failed: {0}")]
    Worker(String),
}

pub struct FlushCoordinator {
    store: Arc<dyn Store>,
}

impl FlushCoordinator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Flush every cache. `expected_blocks` is the size of the range being
    /// flushed; a mismatch against the block rows is fatal, it means blocks
    /// were processed without being registered.
    pub async fn flush(
        &self,
        caches: &CacheRegistry,
        mode: FlushMode,
        expected_blocks: u64,
    ) -> Result<FlushStats, FlushError> {
        let stopwatch = PerfStopwatch::new();
        let stats = match mode {
            FlushMode::Live => self.flush_live(caches, expected_blocks).await?,
            FlushMode::Bulk => self.flush_bulk(caches, expected_blocks).await?,
        };
        for cache in caches.all_caches() {
            cache.mark_flushed();
        }
        tracing::debug!(
            "Flushed {} rows ({} blocks, {mode:?}) in {:?}",
            stats.rows,
            stats.block_rows,
            stopwatch.elapsed()
        );
        Ok(stats)
    }

    async fn flush_live(&self, caches: &CacheRegistry, expected_blocks: u64) -> Result<FlushStats, FlushError> {
        let mut conn = self.store.connection().await?;
        conn.begin().await?;
        match self.flush_live_inner(caches, &mut *conn, expected_blocks).await {
            Ok(stats) => {
                conn.commit().await?;
                Ok(stats)
            }
            Err(err) => {
                if let Err(rollback_err) = conn.rollback().await {
                    tracing::error!("Rollback after failed flush also failed: {rollback_err:#}");
                }
                Err(err)
            }
        }
    }

    async fn flush_live_inner(
        &self,
        caches: &CacheRegistry,
        conn: &mut (dyn StoreConnection + '_),
        expected_blocks: u64,
    ) -> Result<FlushStats, FlushError> {
        let mut stats = FlushStats::default();
        let (independent, dependent) = partition(caches);
        for cache in independent.into_iter().chain(dependent) {
            stats.rows += cache.flush(conn).await?;
        }
        stats.block_rows = caches.blocks.flush(conn).await?;
        stats.rows += stats.block_rows;
        check_block_count(expected_blocks, stats.block_rows)?;
        Ok(stats)
    }

    async fn flush_bulk(&self, caches: &CacheRegistry, expected_blocks: u64) -> Result<FlushStats, FlushError> {
        let mut stats = FlushStats::default();
        // One connection stays reserved for the block anchor.
        let budget = self.store.pool_size().saturating_sub(1).max(1);
        let mut open: Vec<Box<dyn StoreConnection>> = vec![];

        let (independent, dependent) = partition(caches);
        for wave in [independent, dependent] {
            for chunk in wave.chunks(budget) {
                let mut join_set = JoinSet::new();
                for cache in chunk {
                    let cache = cache.clone();
                    let mut conn = match self.store.connection().await {
                        Ok(conn) => conn,
                        Err(err) => {
                            rollback_all(&mut open).await;
                            return Err(err.into());
                        }
                    };
                    join_set.spawn(async move {
                        conn.begin().await?;
                        let rows = cache.flush(&mut *conn).await?;
                        Ok::<_, FlushError>((conn, rows))
                    });
                }

                let mut failure = None;
                while let Some(joined) = join_set.join_next().await {
                    match joined {
                        Ok(Ok((conn, rows))) => {
                            open.push(conn);
                            stats.rows += rows;
                        }
                        Ok(Err(err)) => failure = Some(err),
                        Err(join_err) => failure = Some(FlushError::Worker(join_err.to_string())),
                    }
                }
                if let Some(err) = failure {
                    rollback_all(&mut open).await;
                    return Err(err);
                }
            }
        }

        let mut anchor = self.store.connection().await?;
        let anchored = async {
            anchor.begin().await?;
            let block_rows = caches.blocks.flush(&mut *anchor).await?;
            check_block_count(expected_blocks, block_rows)?;
            Ok::<_, FlushError>(block_rows)
        }
        .await;
        stats.block_rows = match anchored {
            Ok(block_rows) => block_rows,
            Err(err) => {
                let _ = anchor.rollback().await;
                rollback_all(&mut open).await;
                return Err(err);
            }
        };
        stats.rows += stats.block_rows;

        // Point of no return. Entity connections commit first, the anchor
        // with the completed markers commits last.
        for mut conn in open {
            conn.commit().await?;
        }
        anchor.commit().await?;
        Ok(stats)
    }
}

fn partition(caches: &CacheRegistry) -> (Vec<Arc<dyn EntityCache>>, Vec<Arc<dyn EntityCache>>) {
    caches.entity_caches().into_iter().partition(|c| c.phase() == FlushPhase::Independent)
}

fn check_block_count(expected: u64, got: u64) -> Result<(), FlushError> {
    if expected != got {
        return Err(FlushError::BlockCountMismatch { expected, got });
    }
    Ok(())
}

async fn rollback_all(conns: &mut Vec<Box<dyn StoreConnection>>) {
    for conn in conns.iter_mut() {
        if let Err(err) = conn.rollback().await {
            tracing::error!("Rollback of a bulk flush connection failed: {err:#}");
        }
    }
    conns.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::BlockProcessor;
    use ac_db::{MemStore, Value};
    use ap_block::{BlockSource, MockBlock, Operation, Transaction};
    use rstest::rstest;
    use serde_json::json;

    fn vote_block(n: u64) -> BlockSource {
        BlockSource::Mock(MockBlock {
            block_num: n,
            transactions: vec![Transaction {
                operations: vec![Operation {
                    ty: "vote".into(),
                    value: json!({"voter": "alice", "author": "bob", "permlink": format!("p{n}"), "weight": 1}),
                }],
            }],
            ..Default::default()
        })
    }

    #[rstest]
    #[case(FlushMode::Live)]
    #[case(FlushMode::Bulk)]
    #[tokio::test]
    async fn flush_lands_every_cache_and_marks_blocks_completed(#[case] mode: FlushMode) {
        let store = MemStore::new(4);
        let caches = CacheRegistry::default();
        let processor = BlockProcessor::new(caches.clone());
        for n in 1..=3 {
            processor.process(&vote_block(n)).unwrap();
        }

        let coordinator = FlushCoordinator::new(Arc::new(store.clone()));
        let stats = coordinator.flush(&caches, mode, 3).await.unwrap();
        assert_eq!(stats.block_rows, 3);
        assert_eq!(caches.pending_total(), 0);

        let mut conn = store.connection().await.unwrap();
        assert_eq!(conn.latest_block().await.unwrap().unwrap().number, 3);
        assert!(conn
            .get_row("votes", &["alice".into(), "bob".into(), "p2".into()])
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn block_count_mismatch_is_fatal_and_rolls_back() {
        let store = MemStore::new(4);
        let caches = CacheRegistry::default();
        let processor = BlockProcessor::new(caches.clone());
        processor.process(&vote_block(1)).unwrap();

        let coordinator = FlushCoordinator::new(Arc::new(store.clone()));
        let err = coordinator.flush(&caches, FlushMode::Bulk, 2).await.unwrap_err();
        assert_matches::assert_matches!(err, FlushError::BlockCountMismatch { expected: 2, got: 1 });

        // Nothing committed, caches retained.
        let mut conn = store.connection().await.unwrap();
        assert!(conn.get_row("votes", &["alice".into(), "bob".into(), "p1".into()]).await.unwrap().is_none());
        assert!(conn.latest_block().await.unwrap().is_none());
        assert!(caches.pending_total() > 0);
        assert_eq!(conn.get_row("blocks", &[Value::UInt(1)]).await.unwrap(), None);
    }
}
