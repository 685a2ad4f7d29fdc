use crate::rate::BlockRateMeter;
use std::time::Duration;

/// Running totals for the sync process.
pub struct SyncMetrics {
    pub rate: BlockRateMeter,
    pub total_blocks: u64,
    pub total_transactions: u64,
    pub total_operations: u64,
    pub unknown_operations: u64,
    pub micro_forks: u64,
    pub deep_forks: u64,
}

impl SyncMetrics {
    pub fn register(starting_block_n: u64) -> Self {
        Self {
            rate: BlockRateMeter::new(Duration::from_secs(5 * 60)),
            total_blocks: starting_block_n,
            total_transactions: 0,
            total_operations: 0,
            unknown_operations: 0,
            micro_forks: 0,
            deep_forks: 0,
        }
    }

    pub fn observe_block(&mut self, tx_count: usize, op_count: usize) {
        self.rate.record(1);
        self.total_blocks += 1;
        self.total_transactions += tx_count as u64;
        self.total_operations += op_count as u64;
    }
}
