//! Apiary sync. This crate turns a stream of chain blocks into relational
//! rows: posts, votes, accounts, follows, payments and their derived tables.
//!
//! # Architecture
//!
//! The outer [`SyncController`] owns orchestration: it probes the provider
//! head, decides how far to sync, and reports [`ServiceEvent`] transitions.
//! The inner [`IngestionPipeline`] does the work, in four stages:
//!
//! - **Fetch**: [`fetch::BlockStream`] cuts the range into batches and fetches
//!   them over W striped workers. Batch `k` always belongs to worker `k % W`,
//!   so reassembling the ordered stream is a round-robin drain.
//! - **Fork guard**: every block passes through a sliding window of recent
//!   refs ([`fork::ForkGuard`]). A parent-hash mismatch classifies as a micro
//!   fork (rewind caches) or a deep fork (pop the store back to the fork
//!   point and reprocess).
//! - **Process**: [`processor::BlockProcessor`] classifies each operation and
//!   registers rows into the entity caches. Dispatch is total, unknown types
//!   are counted and skipped.
//! - **Flush**: [`flush::FlushCoordinator`] drains the caches at range
//!   boundaries. Live mode is one transaction per block; bulk mode fans the
//!   caches out over the connection pool in two dependency waves, and commits
//!   the block rows (with their `completed` markers) last.
//!
//! Massive sync (far behind the head) runs bulk ranges; within
//! `live_threshold` of the head the pipeline switches to live mode after a
//! finalization pass.

mod caches;
mod fetch;
mod flush;
mod fork;
mod metrics;
mod pipeline;
mod probe;
mod processor;
mod rate;
mod sync;

pub use caches::{CacheError, CacheRegistry, EntityCache, FlushPhase};
pub use fetch::{BlockStream, FetchConfig, FetchError};
pub use flush::{FlushCoordinator, FlushError, FlushMode, FlushStats};
pub use fork::{find_fork_point, ForkError, ForkGuard, RecoveryError, DEFAULT_FORK_WINDOW, DEFAULT_SANITY_DEPTH};
pub use metrics::SyncMetrics;
pub use pipeline::{IngestionPipeline, PipelineConfig};
pub use probe::HeadProbe;
pub use processor::{BlockProcessor, BlockStats, ProcessorError};
pub use sync::{ServiceEvent, SyncController, SyncControllerConfig};

use ac_chain_client::{ChainSource, MockBlocks};
use ac_db::Store;
use std::sync::Arc;
use std::time::Duration;

/// Wire a controller over a provider and a store.
pub fn build_sync(
    source: Arc<dyn ChainSource>,
    store: Arc<dyn Store>,
    overlay: Option<MockBlocks>,
    pipeline_config: PipelineConfig,
    controller_config: SyncControllerConfig,
    probe_interval: Duration,
) -> SyncController {
    let probe = HeadProbe::new(source.clone(), probe_interval);
    let pipeline = IngestionPipeline::new(source, store, overlay, pipeline_config);
    SyncController::new(pipeline, probe, controller_config)
}
