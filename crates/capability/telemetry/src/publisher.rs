//! 指标快照周期推送

use crate::MetricsRegistry;
use chrono::{DateTime, Utc};
use domain::MetricSample;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 推送给订阅方（如 UI）的指标事件
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsEvent {
    pub samples: HashMap<String, MetricSample>,
    pub pushed_at: DateTime<Utc>,
}

pub struct MetricsPublisher {
    registry: MetricsRegistry,
    sender: broadcast::Sender<MetricsEvent>,
}

impl MetricsPublisher {
    pub fn new(registry: MetricsRegistry, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { registry, sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricsEvent> {
        self.sender.subscribe()
    }

    /// 推送一次当前快照，返回接收方数量（无订阅方时为 0）
    pub async fn push_once(&self) -> usize {
        let event = MetricsEvent {
            samples: self.registry.snapshot().await,
            pushed_at: Utc::now(),
        };
        self.sender.send(event).unwrap_or(0)
    }

    pub fn spawn(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(target: "gw.metrics", "metrics_publisher_started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let receivers = self.push_once().await;
                        debug!(target: "gw.metrics", receivers, "metrics_pushed");
                    }
                }
            }
            info!(target: "gw.metrics", "metrics_publisher_stopped");
        })
    }
}
