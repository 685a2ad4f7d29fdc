//! Block throughput over a sliding window.

use std::time::{Duration, Instant};

/// Blocks per second, accumulated into one-second slots on a ring. A slot is
/// reset the first time a newer second writes into it, so entries older than
/// the window never linger.
pub struct BlockRateMeter {
    slots: Box<[u64]>,
    /// Second (since `started`) each slot last accumulated.
    stamps: Box<[u64]>,
    started: Instant,
}

impl BlockRateMeter {
    pub fn new(window: Duration) -> Self {
        let seconds = window.as_secs().max(1) as usize;
        Self {
            slots: vec![0; seconds].into_boxed_slice(),
            stamps: vec![0; seconds].into_boxed_slice(),
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, blocks: u64) {
        self.record_at(blocks, Instant::now())
    }

    fn record_at(&mut self, blocks: u64, now: Instant) {
        let second = now.duration_since(self.started).as_secs();
        let idx = (second % self.slots.len() as u64) as usize;
        if self.stamps[idx] != second {
            self.slots[idx] = 0;
            self.stamps[idx] = second;
        }
        self.slots[idx] += blocks;
    }

    pub fn blocks_per_sec(&self) -> f64 {
        self.blocks_per_sec_at(Instant::now())
    }

    fn blocks_per_sec_at(&self, now: Instant) -> f64 {
        let second = now.duration_since(self.started).as_secs();
        let window = self.slots.len() as u64;
        let total: u64 = self
            .slots
            .iter()
            .zip(self.stamps.iter())
            .filter(|(_, stamp)| second.saturating_sub(**stamp) < window)
            .map(|(count, _)| *count)
            .sum();
        let span = (second + 1).min(window);
        total as f64 / span as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_blocks_per_second_over_the_window() {
        let start = Instant::now();
        let mut meter = BlockRateMeter { started: start, ..BlockRateMeter::new(Duration::from_secs(60)) };
        for i in 0..120 {
            meter.record_at(1, start + Duration::from_millis(500 * i));
        }
        let rate = meter.blocks_per_sec_at(start + Duration::from_secs(60));
        assert!((1.5..=2.5).contains(&rate), "got {rate}");
    }

    #[test]
    fn stale_slots_fall_out_of_the_window() {
        let start = Instant::now();
        let mut meter = BlockRateMeter { started: start, ..BlockRateMeter::new(Duration::from_secs(60)) };
        meter.record_at(100, start);
        assert_eq!(meter.blocks_per_sec_at(start + Duration::from_secs(120)), 0.0);
    }
}
