//! 数据接入。
//!
//! 工业数据源（tag 浏览/订阅）在本网关中只体现为 [`DataSource`]：
//! 产出采集批次并报告连接状态。采集循环按固定周期拉取批次交给路由分发。

mod acquisition;
mod source;

pub use acquisition::AcquisitionLoop;
pub use source::{NoopSource, SimulatedSource, SourceTarget};

use async_trait::async_trait;
use domain::Measurement;

/// 采集错误。
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("source not connected: {0}")]
    NotConnected(String),
    #[error("source error: {0}")]
    Source(String),
}

/// 数据源抽象。
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn connect(&self) -> Result<(), IngestError>;

    /// 拉取自上次调用以来的采集值
    async fn poll(&self) -> Result<Vec<Measurement>, IngestError>;

    async fn disconnect(&self) {}
}
