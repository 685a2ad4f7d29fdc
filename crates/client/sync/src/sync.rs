use crate::metrics::SyncMetrics;
use crate::pipeline::IngestionPipeline;
use crate::probe::HeadProbe;
use ap_utils::{fmt_option, ServiceStateSender};
use futures::future::OptionFuture;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ServiceEvent {
    Starting,
    Idle,
    SyncingTo { target: u64 },
}

pub struct SyncControllerConfig {
    /// Stop the sync process at this block.
    pub stop_at_block_n: Option<u64>,
    /// Cancel the whole service context when the sync process finishes.
    pub global_stop_on_sync: bool,
    /// Stop once the probe stops finding new blocks and there is no work
    /// left. Defaults to running forever.
    pub stop_on_sync: bool,

    /// For testing purposes, you can subscribe to the service state. This is
    /// used in tests to know when the service is idling.
    pub service_state_sender: ServiceStateSender<ServiceEvent>,
}

impl SyncControllerConfig {
    pub fn stop_on_sync(self, stop_on_sync: bool) -> Self {
        Self { stop_on_sync, ..self }
    }
    pub fn stop_at_block_n(self, stop_at_block_n: Option<u64>) -> Self {
        Self { stop_at_block_n, ..self }
    }
    pub fn global_stop_on_sync(self, global_stop_on_sync: bool) -> Self {
        Self { global_stop_on_sync, ..self }
    }
    pub fn service_state_sender(self, service_state_sender: ServiceStateSender<ServiceEvent>) -> Self {
        Self { service_state_sender, ..self }
    }
}

impl Default for SyncControllerConfig {
    fn default() -> Self {
        Self {
            stop_at_block_n: None,
            global_stop_on_sync: false,
            stop_on_sync: false,
            service_state_sender: Default::default(),
        }
    }
}

pub struct SyncController {
    pipeline: IngestionPipeline,
    probe: HeadProbe,
    config: SyncControllerConfig,
    metrics: SyncMetrics,
    status: Option<ServiceEvent>,
}

impl SyncController {
    pub fn new(pipeline: IngestionPipeline, probe: HeadProbe, config: SyncControllerConfig) -> Self {
        Self {
            metrics: SyncMetrics::register(pipeline.next_block_n()),
            pipeline,
            probe,
            config,
            status: None,
        }
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    fn set_status(&mut self, status: ServiceEvent) {
        if self.status != Some(status) {
            self.config.service_state_sender.send(status);
            self.status = Some(status);
        }
    }

    pub async fn run(&mut self, ctx: ap_utils::service::ServiceContext) -> anyhow::Result<()> {
        let interval_duration = Duration::from_secs(3);
        let mut interval = tokio::time::interval_at(Instant::now() + interval_duration, interval_duration);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        self.set_status(ServiceEvent::Starting);
        self.pipeline.init().await?;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = interval.tick() => self.show_status(),
                res = self.run_inner() => break res?,
            }
        }
        self.show_status();
        if self.config.global_stop_on_sync {
            tracing::info!("🌐 Reached stop-on-sync condition, shutting down...");
            ctx.cancel_global();
        } else {
            tracing::info!("🌐 Sync process ended");
        }
        Ok(())
    }

    fn target_height(&self) -> Option<u64> {
        // An overlay may describe blocks past the provider head; they are
        // synthesized by the fetch stage and count toward the target.
        let head = self
            .probe
            .last_val()
            .map(|v| v.head_block.max(self.pipeline.overlay_head().unwrap_or(0)));
        match (head, self.config.stop_at_block_n) {
            (Some(target), Some(stop_at)) if target >= stop_at => Some(stop_at),
            _ => head,
        }
    }

    async fn run_inner(&mut self) -> anyhow::Result<()> {
        loop {
            if let Some(status) = self.probe.last_val() {
                self.pipeline.set_last_irreversible(status.last_irreversible);
            }
            let target_height = self.target_height();
            let can_run_pipeline = target_height.is_some_and(|b| b >= self.pipeline.next_block_n());

            let probe_height = self.probe.last_val().map(|v| v.head_block);
            let target = target_height.filter(|_| can_run_pipeline);
            if let Some(target) = target {
                self.set_status(ServiceEvent::SyncingTo { target });
            } else {
                self.set_status(ServiceEvent::Idle);
            }

            if self.config.stop_at_block_n.is_some_and(|stop_at| self.pipeline.next_block_n() > stop_at) {
                tracing::debug!("End condition for stop_at");
                break Ok(());
            }

            tokio::select! {
                Some(res) = OptionFuture::from(
                    target.map(|target| self.pipeline.run_to(target, &mut self.metrics))
                ) => {
                    res?;
                }
                res = self.probe.run() => {
                    let new_probe_height = res?.map(|v| v.head_block);
                    if self.config.stop_at_block_n.is_none()
                        && !can_run_pipeline
                        && self.config.stop_on_sync
                        && probe_height == new_probe_height
                        && new_probe_height.is_some()
                    {
                        // The probe found nothing new and there is no work
                        // left. Exit condition when stop_on_sync is enabled.
                        break Ok(());
                    }
                }
                else => break Ok(()),
            }
        }
    }

    fn show_status(&self) {
        let latest_block = self.pipeline.latest_block();
        let throughput_sec = self.metrics.rate.blocks_per_sec();
        let target_height = self.target_height();
        self.pipeline.show_status();

        tracing::info!(
            "🔗 Sync is at {}/{} [{throughput_sec:.2} blocks/s]",
            fmt_option(latest_block, "N"),
            fmt_option(target_height, "?")
        );
    }
}
