//! 进程/主机资源与连接状态采样

use crate::MetricsRegistry;
use gw_monitor::ConnectionMonitorState;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub struct MetricsSampler {
    registry: MetricsRegistry,
    system: System,
    pid: Pid,
    started: Instant,
    monitors: Vec<watch::Receiver<ConnectionMonitorState>>,
}

impl MetricsSampler {
    pub fn new(registry: MetricsRegistry) -> Self {
        Self {
            registry,
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
            started: Instant::now(),
            monitors: Vec::new(),
        }
    }

    /// 追加一个连接监控的状态订阅
    pub fn watch_monitor(&mut self, receiver: watch::Receiver<ConnectionMonitorState>) {
        self.monitors.push(receiver);
    }

    pub async fn sample(&mut self) {
        self.sample_process().await;
        self.sample_monitors().await;
    }

    async fn sample_process(&mut self) {
        self.system.refresh_memory();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        let (cpu, memory) = self
            .system
            .process(self.pid)
            .map(|process| (f64::from(process.cpu_usage()), process.memory() as f64))
            .unwrap_or((0.0, 0.0));
        let used = self.system.used_memory() as f64;
        let total = self.system.total_memory() as f64;

        let registry = &self.registry;
        registry.record("process.cpu.percent", cpu, "%").await;
        registry
            .record("process.memory.mb", memory / BYTES_PER_MB, "MB")
            .await;
        registry
            .record("host.memory.used.mb", used / BYTES_PER_MB, "MB")
            .await;
        registry
            .record("host.memory.total.mb", total / BYTES_PER_MB, "MB")
            .await;
        registry
            .record(
                "process.uptime.seconds",
                self.started.elapsed().as_secs_f64(),
                "s",
            )
            .await;
    }

    async fn sample_monitors(&self) {
        for receiver in &self.monitors {
            let state = receiver.borrow().clone();
            let connected = if state.connected { 1.0 } else { 0.0 };
            self.registry
                .record(&format!("{}.connected", state.name), connected, "bool")
                .await;
            self.registry
                .record(
                    &format!("{}.reconnect.count", state.name),
                    state.reconnect_attempts as f64,
                    "count",
                )
                .await;
            self.registry
                .record(
                    &format!("{}.backoff.ms", state.name),
                    state.backoff_ms as f64,
                    "ms",
                )
                .await;
        }
    }

    pub fn spawn(mut self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(target: "gw.metrics", monitors = self.monitors.len(), "metrics_sampler_started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sample().await;
                        debug!(target: "gw.metrics", "metrics_sampled");
                    }
                }
            }
            info!(target: "gw.metrics", "metrics_sampler_stopped");
        })
    }
}
