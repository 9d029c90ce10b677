use crate::MonitorError;
use async_trait::async_trait;
use gw_protocol::ProtocolAdapter;
use std::sync::Arc;

/// 被监控的连接：一个连接状态探针 + 一个重连操作。
#[async_trait]
pub trait MonitorTarget: Send + Sync {
    fn is_connected(&self) -> bool;

    /// 返回重连后是否处于连接状态
    async fn reconnect(&self) -> Result<bool, MonitorError>;
}

/// 下行适配器作为监控目标
pub struct AdapterTarget(pub Arc<dyn ProtocolAdapter>);

#[async_trait]
impl MonitorTarget for AdapterTarget {
    fn is_connected(&self) -> bool {
        self.0.is_connected()
    }

    async fn reconnect(&self) -> Result<bool, MonitorError> {
        self.0
            .reconnect()
            .await
            .map_err(|err| MonitorError::Reconnect(err.to_string()))
    }
}
