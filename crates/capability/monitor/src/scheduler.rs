use crate::ConnectionMonitor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 全局重连开关，有序停机期间暂停所有重连
#[derive(Debug, Clone, Default)]
pub struct ReconnectGate {
    paused: Arc<AtomicBool>,
}

impl ReconnectGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// 按固定周期顺序驱动全部监控
pub struct MonitorScheduler {
    monitors: Vec<ConnectionMonitor>,
    interval: Duration,
    gate: ReconnectGate,
}

impl MonitorScheduler {
    pub fn new(interval: Duration, gate: ReconnectGate) -> Self {
        Self {
            monitors: Vec::new(),
            interval: interval.max(Duration::from_millis(1)),
            gate,
        }
    }

    pub fn add(&mut self, monitor: ConnectionMonitor) {
        self.monitors.push(monitor);
    }

    pub fn monitors(&self) -> &[ConnectionMonitor] {
        &self.monitors
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(target: "gw.monitor", monitors = self.monitors.len(), "monitor_scheduler_started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for monitor in &mut self.monitors {
                        monitor.tick(&self.gate).await;
                    }
                }
            }
        }
        for monitor in &mut self.monitors {
            monitor.abort();
        }
        info!(target: "gw.monitor", "monitor_scheduler_stopped");
    }
}
