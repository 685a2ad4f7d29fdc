//! Concurrent range fetching with ordered reassembly.
//!
//! The range is cut into fixed-size batches. Batch `k` is always fetched by
//! worker `k % W` and sent on that worker's channel, in order. The collector
//! therefore reassembles the stream by draining the channels round-robin:
//! batch 0 from channel 0, batch 1 from channel 1, and so on. No sorting, no
//! lookahead buffer past one batch per worker.

use ac_chain_client::{ChainClientError, ChainSource, MockBlocks};
use ap_block::{BlockRange, BlockSource, MockBlock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

#[derive(Clone, Debug)]
pub struct FetchConfig {
    /// W, the number of concurrent fetch workers.
    pub workers: usize,
    /// Blocks per batch request.
    pub batch_size: u64,
    /// Batches buffered per worker channel.
    pub channel_capacity: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { workers: 4, batch_size: 100, channel_capacity: 4 }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Client(#[from] ChainClientError),
    #[error("Fetch worker panicked: {0}")]
    WorkerPanic(String),
}

struct FetchedBatch {
    blocks: Vec<BlockSource>,
}

/// Ordered stream of blocks over a range. Dropping the stream aborts the
/// workers.
pub struct BlockStream {
    receivers: Vec<mpsc::Receiver<FetchedBatch>>,
    workers: JoinSet<Result<(), ChainClientError>>,
    overlay: Option<MockBlocks>,
    buffer: VecDeque<BlockSource>,
    range: BlockRange,
    batch_size: u64,
    next_batch: u64,
    num_batches: u64,
    /// Hash of the last block handed to the buffer, linking synthesized
    /// blocks onto the primary chain.
    last_hash: Option<String>,
}

impl BlockStream {
    pub fn spawn(
        source: Arc<dyn ChainSource>,
        range: BlockRange,
        overlay: Option<MockBlocks>,
        config: &FetchConfig,
    ) -> Self {
        let workers_n = config.workers.max(1);
        let num_batches = range.len().div_ceil(config.batch_size.max(1));
        let batch_size = config.batch_size.max(1);

        let mut receivers = Vec::with_capacity(workers_n);
        let mut workers = JoinSet::new();
        for worker in 0..workers_n {
            let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
            receivers.push(receiver);
            let source = source.clone();
            workers.spawn(async move {
                let mut batch_index = worker as u64;
                while batch_index < num_batches {
                    let first = range.first + batch_index * batch_size;
                    let last = (first + batch_size - 1).min(range.last);
                    let sub = BlockRange::new(first, last);

                    let mut blocks = source.block_batch(sub).await?;
                    let mut vops = source.virtual_ops(sub).await?;
                    for block in &mut blocks {
                        if let BlockSource::Node(node_block) = block {
                            node_block.virtual_ops = vops.remove(&node_block.block_num).unwrap_or_default();
                        }
                    }
                    tracing::trace!("Worker {worker} fetched batch {batch_index} {sub}");

                    if sender.send(FetchedBatch { blocks }).await.is_err() {
                        // Collector dropped, stop quietly.
                        return Ok(());
                    }
                    batch_index += workers_n as u64;
                }
                Ok(())
            });
        }

        Self {
            receivers,
            workers,
            overlay,
            buffer: VecDeque::new(),
            range,
            batch_size,
            next_batch: 0,
            num_batches,
            last_hash: None,
        }
    }

    /// The next block in strict ascending order, or `None` once the range is
    /// exhausted.
    pub async fn next_block(&mut self) -> Result<Option<BlockSource>, FetchError> {
        loop {
            if let Some(block) = self.buffer.pop_front() {
                return Ok(Some(block));
            }
            if self.next_batch >= self.num_batches {
                return Ok(None);
            }

            let channel = (self.next_batch % self.receivers.len() as u64) as usize;
            match self.receivers[channel].recv().await {
                Some(batch) => {
                    let first = self.range.first + self.next_batch * self.batch_size;
                    let sub = BlockRange::new(first, (first + self.batch_size - 1).min(self.range.last));
                    self.next_batch += 1;
                    self.collect_batch(sub, batch.blocks);
                }
                // Channel closed before the range was done: a worker bailed.
                None => return Err(self.take_worker_error().await),
            }
        }
    }

    /// Slot the fetched blocks into their heights. Heights the primary lacks
    /// (past its head) are synthesized from the overlay, chained onto the
    /// hash of the block before them.
    fn collect_batch(&mut self, sub: BlockRange, blocks: Vec<BlockSource>) {
        let mut primary: BTreeMap<u64, BlockSource> = blocks.into_iter().map(|b| (b.number(), b)).collect();
        for block_n in sub.iter() {
            let block = match primary.remove(&block_n) {
                Some(block) => self.merge_overlay(block),
                None => {
                    let Some(overlay) = self.overlay.as_ref() else { continue };
                    let mut mock = overlay
                        .get(block_n)
                        .cloned()
                        .unwrap_or(MockBlock { block_num: block_n, ..Default::default() });
                    if mock.previous.is_none() {
                        mock.previous = self.last_hash.clone();
                    }
                    BlockSource::Mock(mock)
                }
            };
            self.last_hash = Some(block.hash());
            self.buffer.push_back(block);
        }
    }

    fn merge_overlay(&self, block: BlockSource) -> BlockSource {
        match self.overlay.as_ref().and_then(|o| o.get(block.number())).cloned() {
            Some(overlay_block) => block.merge(overlay_block),
            None => block,
        }
    }

    async fn take_worker_error(&mut self) -> FetchError {
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => return err.into(),
                Err(err) => return FetchError::WorkerPanic(err.to_string()),
            }
        }
        FetchError::WorkerPanic("worker channel closed without an error".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ac_chain_client::{ChainStatus, MockSource};
    use ap_block::{MockBlock, VirtualOperation};
    use rstest::rstest;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Completes requests after a random delay, so batches land out of order.
    struct JitterSource(MockSource);

    #[async_trait::async_trait]
    impl ChainSource for JitterSource {
        async fn block_batch(&self, range: BlockRange) -> Result<Vec<BlockSource>, ChainClientError> {
            tokio::time::sleep(Duration::from_millis(rand::random::<u64>() % 5)).await;
            self.0.block_batch(range).await
        }

        async fn virtual_ops(
            &self,
            range: BlockRange,
        ) -> Result<HashMap<u64, Vec<VirtualOperation>>, ChainClientError> {
            self.0.virtual_ops(range).await
        }

        async fn status(&self) -> Result<ChainStatus, ChainClientError> {
            self.0.status().await
        }
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(4)]
    #[case(8)]
    #[tokio::test]
    async fn blocks_arrive_in_strict_order(#[case] workers: usize) {
        let source = Arc::new(JitterSource(MockSource::new(MockBlocks::default(), Some(200))));
        let config = FetchConfig { workers, batch_size: 7, channel_capacity: 2 };
        let mut stream = BlockStream::spawn(source, BlockRange::new(100, 200), None, &config);

        let mut expected = 100;
        while let Some(block) = stream.next_block().await.unwrap() {
            assert_eq!(block.number(), expected);
            expected += 1;
        }
        assert_eq!(expected, 201);
    }

    #[tokio::test]
    async fn overlay_heights_past_the_provider_head_are_synthesized() {
        let overlay = MockBlocks::from_blocks([MockBlock {
            block_num: 12,
            transactions: vec![ap_block::Transaction {
                operations: vec![ap_block::Operation { ty: "vote".into(), value: serde_json::json!({}) }],
            }],
            ..Default::default()
        }]);
        let source = Arc::new(MockSource::new(MockBlocks::default(), Some(10)));
        let mut stream =
            BlockStream::spawn(source, BlockRange::new(9, 12), Some(overlay), &FetchConfig::default());

        let mut blocks = vec![];
        while let Some(block) = stream.next_block().await.unwrap() {
            blocks.push(block);
        }
        assert_eq!(blocks.iter().map(|b| b.number()).collect::<Vec<_>>(), vec![9, 10, 11, 12]);
        assert_eq!(blocks.iter().map(|b| b.op_count()).collect::<Vec<_>>(), vec![0, 0, 0, 1]);
        // Synthesized blocks stay linked onto the primary chain.
        for pair in blocks.windows(2) {
            assert_eq!(pair[1].previous_hash(), pair[0].hash());
        }
    }

    #[tokio::test]
    async fn overlay_payloads_are_merged() {
        let overlay = MockBlocks::from_blocks([MockBlock {
            block_num: 3,
            transactions: vec![ap_block::Transaction {
                operations: vec![ap_block::Operation { ty: "vote".into(), value: serde_json::json!({}) }],
            }],
            ..Default::default()
        }]);
        let source = Arc::new(MockSource::new(MockBlocks::default(), Some(5)));
        let mut stream =
            BlockStream::spawn(source, BlockRange::new(1, 5), Some(overlay), &FetchConfig::default());

        let mut op_counts = vec![];
        while let Some(block) = stream.next_block().await.unwrap() {
            op_counts.push(block.op_count());
        }
        assert_eq!(op_counts, vec![0, 0, 1, 0, 0]);
    }
}
