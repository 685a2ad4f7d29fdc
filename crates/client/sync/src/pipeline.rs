//! The ingestion pipeline: fetch, order, process, flush, with fork handling
//! in the middle.

use crate::caches::CacheRegistry;
use crate::fetch::{BlockStream, FetchConfig, FetchError};
use crate::flush::{FlushCoordinator, FlushMode};
use crate::fork::{find_fork_point, ForkError, ForkGuard, DEFAULT_FORK_WINDOW, DEFAULT_SANITY_DEPTH};
use crate::metrics::SyncMetrics;
use crate::processor::BlockProcessor;
use ac_chain_client::{ChainSource, MockBlocks};
use ac_db::Store;
use anyhow::Context;
use ap_block::BlockRange;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub fetch: FetchConfig,
    /// First block to index on an empty store.
    pub start_block: u64,
    /// Blocks per bulk flush range.
    pub flush_every: u64,
    /// At most this many blocks behind the target, the pipeline runs in live
    /// mode: block at a time, one transaction each.
    pub live_threshold: u64,
    /// Fork guard window depth. Zero disables fork checking.
    pub fork_window: usize,
    pub fork_sanity_depth: u64,
    /// Blocks between maintenance passes in live mode.
    pub maintenance_interval: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            start_block: 1,
            flush_every: 1000,
            live_threshold: 10,
            fork_window: DEFAULT_FORK_WINDOW,
            fork_sanity_depth: DEFAULT_SANITY_DEPTH,
            maintenance_interval: 1200,
        }
    }
}

enum RangeOutcome {
    Done,
    /// Restart processing from this block; earlier work was discarded.
    RestartAt(u64),
}

pub struct IngestionPipeline {
    source: Arc<dyn ChainSource>,
    store: Arc<dyn Store>,
    caches: CacheRegistry,
    processor: BlockProcessor,
    flush: FlushCoordinator,
    fork_guard: ForkGuard,
    overlay: Option<MockBlocks>,
    config: PipelineConfig,
    next_block_n: u64,
    /// First block whose rows are still cache-only. Everything below it has
    /// been committed.
    first_unflushed: u64,
    last_irreversible: u64,
    last_maintenance: u64,
    in_massive_sync: bool,
}

impl IngestionPipeline {
    pub fn new(
        source: Arc<dyn ChainSource>,
        store: Arc<dyn Store>,
        overlay: Option<MockBlocks>,
        config: PipelineConfig,
    ) -> Self {
        let caches = CacheRegistry::new(Some(config.maintenance_interval * 90));
        Self {
            processor: BlockProcessor::new(caches.clone()),
            flush: FlushCoordinator::new(store.clone()),
            fork_guard: ForkGuard::new(config.fork_window),
            caches,
            source,
            store,
            overlay,
            next_block_n: config.start_block,
            first_unflushed: config.start_block,
            config,
            last_irreversible: 0,
            last_maintenance: 0,
            in_massive_sync: false,
        }
    }

    pub fn next_block_n(&self) -> u64 {
        self.next_block_n
    }

    pub fn latest_block(&self) -> Option<u64> {
        self.next_block_n.checked_sub(1).filter(|_| self.next_block_n > self.config.start_block)
    }

    /// Highest block the mock overlay describes, if any.
    pub fn overlay_head(&self) -> Option<u64> {
        self.overlay.as_ref().and_then(|o| o.max_block())
    }

    pub fn set_last_irreversible(&mut self, block_n: u64) {
        self.last_irreversible = self.last_irreversible.max(block_n);
    }

    /// Startup recovery: truncate half-flushed work, resume after the store
    /// head, and verify that head still belongs to the provider's chain.
    pub async fn init(&mut self) -> anyhow::Result<()> {
        let mut conn = self.store.connection().await?;
        let truncated = conn.truncate_incomplete().await?;
        if truncated > 0 {
            tracing::info!("🧹 Truncated {truncated} incomplete blocks from a previous run");
        }

        let Some(head) = conn.latest_block().await? else {
            tracing::info!("🔭 Empty store, starting at block {}", self.config.start_block);
            return Ok(());
        };

        if self.config.fork_window > 0 {
            let remote_hash = self
                .source
                .block_batch(BlockRange::single(head.number))
                .await?
                .pop()
                .map(|b| b.hash())
                .unwrap_or_default();
            if remote_hash != head.hash {
                tracing::warn!("⚠️ Store head {} no longer matches the provider, recovering", head.number);
                let fork_point = find_fork_point(
                    &mut *conn,
                    &*self.source,
                    head.number,
                    self.last_irreversible,
                    self.config.fork_sanity_depth,
                )
                .await
                .context("Recovering from divergent store head")?;
                let popped = conn.pop_blocks_above(fork_point).await?;
                tracing::info!("⛓️ Popped {popped} blocks down to {fork_point}");
                self.next_block_n = fork_point + 1;
                self.first_unflushed = self.next_block_n;
                self.fork_guard.seed(conn.latest_block().await?);
                return Ok(());
            }
        }

        self.next_block_n = head.number + 1;
        self.first_unflushed = self.next_block_n;
        self.fork_guard.seed(Some(head));
        tracing::info!("🔭 Resuming at block {}", self.next_block_n);
        Ok(())
    }

    /// Drive ingestion up to `target` (inclusive).
    pub async fn run_to(&mut self, target: u64, metrics: &mut SyncMetrics) -> anyhow::Result<()> {
        while self.next_block_n <= target {
            let gap = target - self.next_block_n + 1;
            let bulk = gap > self.config.live_threshold;
            if bulk {
                self.in_massive_sync = true;
            } else if self.in_massive_sync {
                self.finalize_massive_sync().await?;
            }

            let (mode, last) = if bulk {
                (FlushMode::Bulk, target.min(self.next_block_n + self.config.flush_every - 1))
            } else {
                (FlushMode::Live, self.next_block_n)
            };
            let range = BlockRange::new(self.next_block_n, last);

            match self.process_range(range, mode, metrics).await? {
                RangeOutcome::Done => {
                    self.next_block_n = range.last + 1;
                    if mode == FlushMode::Live {
                        self.run_maintenance_if_due().await?;
                    }
                }
                RangeOutcome::RestartAt(block_n) => self.next_block_n = block_n,
            }
        }
        Ok(())
    }

    async fn process_range(
        &mut self,
        range: BlockRange,
        mode: FlushMode,
        metrics: &mut SyncMetrics,
    ) -> anyhow::Result<RangeOutcome> {
        tracing::debug!("Processing {range} ({mode:?})");
        // The caller may have dropped an earlier pass over this range mid
        // flight. Registrations and window entries at or above its first
        // block belong to that abandoned pass and would be re-registered.
        self.caches.discard_from(range.first);
        self.fork_guard.rewind_to(range.first.saturating_sub(1));
        let mut stream = BlockStream::spawn(self.source.clone(), range, self.overlay.clone(), &self.config.fetch);

        loop {
            let block = match stream.next_block().await {
                Ok(Some(block)) => block,
                Ok(None) => break,
                Err(FetchError::Client(err)) => return Err(err).context(format!("Fetching {range}")),
                Err(err @ FetchError::WorkerPanic(_)) => return Err(err.into()),
            };

            if let Err(fork) = self.fork_guard.observe(&block) {
                return self.handle_fork(fork, range, metrics).await;
            }

            let stats = self.processor.process(&block)?;
            metrics.observe_block(stats.transactions, stats.operations);
            metrics.unknown_operations += stats.unknown_operations as u64;
        }

        let expected_blocks = range.last + 1 - self.first_unflushed;
        self.flush.flush(&self.caches, mode, expected_blocks).await.with_context(|| format!("Flushing {range}"))?;
        self.first_unflushed = range.last + 1;
        Ok(RangeOutcome::Done)
    }

    async fn handle_fork(
        &mut self,
        fork: ForkError,
        range: BlockRange,
        metrics: &mut SyncMetrics,
    ) -> anyhow::Result<RangeOutcome> {
        match fork {
            ForkError::Micro { block_n, fork_point } => {
                tracing::warn!("🔀 Micro fork at block {block_n}, rewinding to {fork_point}");
                metrics.micro_forks += 1;
                self.caches.discard_from(fork_point + 1);
                // In live mode the window can reach below the last flush.
                let mut conn = self.store.connection().await?;
                let popped = conn.pop_blocks_above(fork_point).await?;
                if popped > 0 {
                    tracing::info!("⛓️ Popped {popped} flushed blocks down to {fork_point}");
                }
                self.fork_guard.rewind_to(fork_point);
                self.first_unflushed = self.first_unflushed.min(fork_point + 1);
                Ok(RangeOutcome::RestartAt(fork_point + 1))
            }
            ForkError::Deep { block_n } => {
                tracing::warn!("🔀 Fork at block {block_n}, searching the store for a fork point");
                let mut conn = self.store.connection().await?;
                let walk_from = range.first.saturating_sub(1);
                let fork_point = find_fork_point(
                    &mut *conn,
                    &*self.source,
                    walk_from,
                    self.last_irreversible,
                    self.config.fork_sanity_depth,
                )
                .await
                .context("Recovering from fork")?;
                let popped = conn.pop_blocks_above(fork_point).await?;
                tracing::info!("⛓️ Popped {popped} blocks down to {fork_point}, reprocessing");
                self.fork_guard.rewind_to(fork_point);
                if self.fork_guard.last().is_some_and(|r| r.number == fork_point) {
                    // Divergence is still inside the window: rewinding the
                    // caches is enough.
                    metrics.micro_forks += 1;
                    self.caches.discard_from(fork_point + 1);
                    self.first_unflushed = self.first_unflushed.min(fork_point + 1);
                } else {
                    metrics.deep_forks += 1;
                    self.caches.clear();
                    self.first_unflushed = fork_point + 1;
                    self.fork_guard.seed(conn.latest_block().await?);
                }
                Ok(RangeOutcome::RestartAt(fork_point + 1))
            }
            err @ ForkError::BeyondRecovery { .. } => Err(err.into()),
        }
    }

    /// Massive sync ends in two strictly ordered steps: the last bulk ranges
    /// are already committed when this runs, then one maintenance pass brings
    /// derived tables in shape before live mode begins.
    async fn finalize_massive_sync(&mut self) -> anyhow::Result<()> {
        tracing::info!("🏁 Massive sync finished, finalizing before live mode");
        self.in_massive_sync = false;
        self.run_maintenance().await?;
        self.last_maintenance = self.next_block_n;
        Ok(())
    }

    async fn run_maintenance_if_due(&mut self) -> anyhow::Result<()> {
        if self.next_block_n.saturating_sub(self.last_maintenance) >= self.config.maintenance_interval {
            self.run_maintenance().await?;
            self.last_maintenance = self.next_block_n;
        }
        Ok(())
    }

    async fn run_maintenance(&mut self) -> anyhow::Result<()> {
        let mut conn = self.store.connection().await?;
        if let Some(retention) = self.caches.notifications.retention_blocks() {
            let threshold = self.next_block_n.saturating_sub(retention);
            if threshold > 0 {
                let pruned = conn.prune_below("notifications", "block_num", threshold).await?;
                if pruned > 0 {
                    tracing::debug!("🧹 Pruned {pruned} notifications below block {threshold}");
                }
            }
        }
        Ok(())
    }

    pub fn show_status(&self) {
        tracing::debug!(
            "Pipeline at block {}, {} rows pending across caches",
            self.next_block_n,
            self.caches.pending_total()
        );
    }
}
