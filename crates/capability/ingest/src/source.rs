use crate::{DataSource, IngestError};
use async_trait::async_trait;
use domain::{Measurement, Quality, TagValue};
use gw_monitor::{MonitorError, MonitorTarget};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;

/// 模拟数据源：每次 poll 为每个 tag 生成一个正弦值。
pub struct SimulatedSource {
    tags: Vec<String>,
    connected: AtomicBool,
    cycle: AtomicU64,
}

impl SimulatedSource {
    pub fn new(tags: Vec<String>) -> Self {
        Self {
            tags,
            connected: AtomicBool::new(false),
            cycle: AtomicU64::new(0),
        }
    }

    /// 模拟链路中断（测试/演示用）
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataSource for SimulatedSource {
    fn name(&self) -> &str {
        "simulated"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), IngestError> {
        self.connected.store(true, Ordering::SeqCst);
        info!(target: "gw.ingest", tags = self.tags.len(), "simulated_source_connected");
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<Measurement>, IngestError> {
        if !self.is_connected() {
            return Err(IngestError::NotConnected(self.name().to_string()));
        }
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .tags
            .iter()
            .enumerate()
            .map(|(index, tag)| {
                let phase = cycle as f64 * 0.1 + index as f64;
                Measurement::new(tag.clone(), TagValue::F64(phase.sin() * 100.0), Quality::Good)
            })
            .collect())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// 空数据源：始终在线，不产出数据。
#[derive(Debug, Default)]
pub struct NoopSource;

#[async_trait]
impl DataSource for NoopSource {
    fn name(&self) -> &str {
        "noop"
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<(), IngestError> {
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<Measurement>, IngestError> {
        Ok(Vec::new())
    }
}

/// 数据源作为连接监控目标
pub struct SourceTarget(pub Arc<dyn DataSource>);

#[async_trait]
impl MonitorTarget for SourceTarget {
    fn is_connected(&self) -> bool {
        self.0.is_connected()
    }

    async fn reconnect(&self) -> Result<bool, MonitorError> {
        self.0
            .connect()
            .await
            .map_err(|err| MonitorError::Reconnect(err.to_string()))?;
        Ok(self.0.is_connected())
    }
}
