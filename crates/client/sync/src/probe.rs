//! Throttled head polling.

use ac_chain_client::{ChainClientError, ChainSource, ChainStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Polls the provider for its head, at most once per interval. `run` resolves
/// with the latest known status once the throttle allows a new request.
pub struct HeadProbe {
    source: Arc<dyn ChainSource>,
    min_interval: Duration,
    last_run: Option<Instant>,
    last_val: Option<ChainStatus>,
}

impl HeadProbe {
    pub fn new(source: Arc<dyn ChainSource>, min_interval: Duration) -> Self {
        Self { source, min_interval, last_run: None, last_val: None }
    }

    pub fn last_val(&self) -> Option<ChainStatus> {
        self.last_val
    }

    pub async fn run(&mut self) -> Result<Option<ChainStatus>, ChainClientError> {
        if let Some(last_run) = self.last_run {
            tokio::time::sleep_until(last_run + self.min_interval).await;
        }
        self.last_run = Some(Instant::now());
        match self.source.status().await {
            Ok(status) => {
                tracing::debug!("Probe: head={} lib={}", status.head_block, status.last_irreversible);
                self.last_val = Some(status);
                Ok(Some(status))
            }
            Err(err) => {
                // A transient probe failure must not kill the sync loop.
                tracing::warn!("Head probe failed: {err:#}");
                Ok(self.last_val)
            }
        }
    }
}
