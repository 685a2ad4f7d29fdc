use ac_sync::{FetchConfig, PipelineConfig, SyncControllerConfig, DEFAULT_FORK_WINDOW, DEFAULT_SANITY_DEPTH};
use ap_utils::parsers::parse_duration;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parameters for the sync process.
#[derive(Clone, Debug, clap::Args, Deserialize, Serialize)]
pub struct SyncParams {
    /// First block to index when the store is empty.
    #[clap(env = "APIARY_START_BLOCK", long, default_value_t = 1, value_name = "BLOCK NUMBER")]
    pub start_block: u64,

    /// Stop the sync process at a specific block_n. May be useful for
    /// benchmarking or for indexing a fixed prefix of the chain.
    #[clap(env = "APIARY_SYNC_STOP_AT", long, value_name = "BLOCK NUMBER")]
    pub sync_stop_at: Option<u64>,

    /// Stop the node once the chain head has been reached and the provider
    /// stops announcing new blocks.
    #[clap(env = "APIARY_STOP_ON_SYNC", long)]
    pub stop_on_sync: bool,

    /// Number of concurrent fetch workers.
    #[clap(env = "APIARY_FETCH_WORKERS", long, default_value_t = 4)]
    pub fetch_workers: usize,

    /// Blocks per batch request.
    #[clap(env = "APIARY_BATCH_SIZE", long, default_value_t = 100, value_name = "BLOCKS")]
    pub batch_size: u64,

    /// Blocks per bulk flush range during massive sync.
    #[clap(env = "APIARY_FLUSH_EVERY", long, default_value_t = 1000, value_name = "BLOCKS")]
    pub flush_every: u64,

    /// Within this many blocks of the head, the pipeline switches to live
    /// mode: one block per transaction.
    #[clap(env = "APIARY_LIVE_THRESHOLD", long, default_value_t = 10, value_name = "BLOCKS")]
    pub live_threshold: u64,

    /// Fork detection window depth. Zero disables fork checking, which is
    /// only safe for mock and secondary database sources.
    #[clap(env = "APIARY_FORK_WINDOW", long, default_value_t = DEFAULT_FORK_WINDOW, value_name = "BLOCKS")]
    pub fork_window: usize,

    /// Deepest fork-point search before giving up.
    #[clap(env = "APIARY_FORK_SANITY_DEPTH", long, default_value_t = DEFAULT_SANITY_DEPTH, value_name = "BLOCKS")]
    pub fork_sanity_depth: u64,

    /// Blocks between maintenance passes in live mode.
    #[clap(env = "APIARY_MAINTENANCE_INTERVAL", long, default_value_t = 1200, value_name = "BLOCKS")]
    pub maintenance_interval: u64,

    /// Minimum delay between chain head probes.
    #[clap(env = "APIARY_PROBE_INTERVAL", long, default_value = "2s", value_parser = parse_duration, value_name = "DURATION")]
    pub probe_interval: Duration,

    /// Store connection pool size. Bulk flushes fan out up to this far.
    #[clap(env = "APIARY_POOL_SIZE", long, default_value_t = 8)]
    pub pool_size: usize,
}

impl SyncParams {
    /// Pipeline settings derived from the command line.
    pub fn pipeline_config(&self, fork_checking: bool) -> PipelineConfig {
        PipelineConfig {
            fetch: FetchConfig {
                workers: self.fetch_workers.max(1),
                batch_size: self.batch_size.max(1),
                ..Default::default()
            },
            start_block: self.start_block.max(1),
            flush_every: self.flush_every.max(1),
            live_threshold: self.live_threshold,
            fork_window: if fork_checking { self.fork_window } else { 0 },
            fork_sanity_depth: self.fork_sanity_depth,
            maintenance_interval: self.maintenance_interval.max(1),
        }
    }

    /// Controller settings derived from the command line.
    pub fn controller_config(&self) -> SyncControllerConfig {
        SyncControllerConfig::default()
            .stop_at_block_n(self.sync_stop_at)
            .stop_on_sync(self.stop_on_sync)
            .global_stop_on_sync(self.stop_on_sync)
    }
}
