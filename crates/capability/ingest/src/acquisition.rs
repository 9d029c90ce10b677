use crate::DataSource;
use gw_router::ProtocolRouter;
use gw_telemetry::MetricsRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 周期拉取数据源并通过路由分发
pub struct AcquisitionLoop {
    source: Arc<dyn DataSource>,
    router: Arc<ProtocolRouter>,
    metrics: MetricsRegistry,
    interval: Duration,
}

impl AcquisitionLoop {
    pub fn new(
        source: Arc<dyn DataSource>,
        router: Arc<ProtocolRouter>,
        metrics: MetricsRegistry,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            router,
            metrics,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// 执行一个采集周期，返回本周期是否分发成功（无数据时为 None）
    pub async fn run_once(&self) -> Option<bool> {
        if !self.source.is_connected() {
            debug!(target: "gw.ingest", source = %self.source.name(), "source_offline_skip");
            return None;
        }
        let batch = match self.source.poll().await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(target: "gw.ingest", source = %self.source.name(), error = %err, "source_poll_failed");
                return None;
            }
        };
        if batch.is_empty() {
            return None;
        }

        let report = self.router.dispatch(&batch).await;
        if report.is_success() {
            self.metrics.increment("router.dispatch.success").await;
        } else {
            self.metrics.increment("router.dispatch.failure").await;
            warn!(
                target: "gw.ingest",
                size = batch.len(),
                outcome = ?report.outcome,
                "batch_dispatch_failed"
            );
        }
        Some(report.is_success())
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                target: "gw.ingest",
                source = %self.source.name(),
                interval_ms = self.interval.as_millis() as u64,
                "acquisition_started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
            info!(target: "gw.ingest", "acquisition_stopped");
        })
    }
}
