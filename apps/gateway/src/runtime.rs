//! 运行时装配
//!
//! 把数据源、路由、连接监控、指标采样与推送组装成一组后台任务，
//! 并在退出时按顺序停止。

use gw_config::{AppConfig, SourceKind};
use gw_ingest::{AcquisitionLoop, DataSource, NoopSource, SimulatedSource, SourceTarget};
use gw_monitor::{
    AdapterTarget, ConnectionMonitor, MonitorScheduler, MonitorSettings, ReconnectGate,
};
use gw_router::ProtocolRouter;
use gw_telemetry::{MetricsPublisher, MetricsRegistry, MetricsSampler};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 指标推送通道容量
const METRICS_CHANNEL_CAPACITY: usize = 16;

pub struct Runtime {
    cancel: CancellationToken,
    gate: ReconnectGate,
    router: Arc<ProtocolRouter>,
    source: Arc<dyn DataSource>,
    tasks: Vec<JoinHandle<()>>,
}

pub async fn start(config: &AppConfig, router: Arc<ProtocolRouter>) -> Runtime {
    let cancel = CancellationToken::new();
    let gate = ReconnectGate::new();
    let registry = MetricsRegistry::new();

    // 1. 数据源：连接失败不阻塞启动，交给监控重连
    let source = build_source(config);
    if let Err(err) = source.connect().await {
        warn!(target: "gw.ingest", source = %source.name(), error = %err, "source_connect_failed");
    }

    // 2. 连接监控：数据源 + 每个活动适配器各一个
    let settings = MonitorSettings {
        reconnect_timeout: Duration::from_millis(config.reconnect_timeout_ms),
        ..MonitorSettings::default()
    };
    let mut scheduler =
        MonitorScheduler::new(Duration::from_millis(config.monitor_tick_ms), gate.clone());
    let mut sampler = MetricsSampler::new(registry.clone());

    let source_monitor = ConnectionMonitor::with_settings(
        "source",
        Arc::new(SourceTarget(source.clone())),
        settings.clone(),
    );
    sampler.watch_monitor(source_monitor.subscribe());
    scheduler.add(source_monitor);

    for adapter in router.adapters().await {
        let name = adapter.key().to_string();
        let monitor =
            ConnectionMonitor::with_settings(name, Arc::new(AdapterTarget(adapter)), settings.clone());
        sampler.watch_monitor(monitor.subscribe());
        scheduler.add(monitor);
    }
    info!(target: "gw.monitor", monitors = scheduler.monitors().len(), "monitors_registered");

    // 3. 后台任务
    let publisher = MetricsPublisher::new(registry.clone(), METRICS_CHANNEL_CAPACITY);
    let acquisition = AcquisitionLoop::new(
        source.clone(),
        router.clone(),
        registry,
        Duration::from_millis(config.poll_interval_ms),
    );
    let tasks = vec![
        scheduler.spawn(cancel.clone()),
        sampler.spawn(Duration::from_millis(config.metrics_sample_ms), cancel.clone()),
        publisher.spawn(Duration::from_millis(config.metrics_push_ms), cancel.clone()),
        acquisition.spawn(cancel.clone()),
    ];

    Runtime {
        cancel,
        gate,
        router,
        source,
        tasks,
    }
}

fn build_source(config: &AppConfig) -> Arc<dyn DataSource> {
    match config.source {
        SourceKind::Simulated => {
            info!(target: "gw.ingest", tags = ?config.source_tags, "source_simulated");
            Arc::new(SimulatedSource::new(config.source_tags.clone()))
        }
        SourceKind::Noop => {
            info!(target: "gw.ingest", "source_noop");
            Arc::new(NoopSource)
        }
    }
}

impl Runtime {
    /// 有序停止：先暂停重连与取消所有循环，再断开适配器和数据源
    pub async fn shutdown(self) {
        self.gate.pause();
        self.cancel.cancel();
        self.router.stop_all().await;
        self.source.disconnect().await;
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background_task_join_failed");
            }
        }
        info!("gateway_stopped");
    }
}
