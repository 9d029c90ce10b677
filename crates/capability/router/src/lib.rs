//! 协议路由。
//!
//! ```text
//! Measurement[] ──dispatch──▶ ProtocolRouter
//!                                 ├──spawn──▶ msa.send()
//!                                 ├──spawn──▶ modbusTcp.send()
//!                                 └──spawn──▶ mqtt.send()
//! ```
//!
//! 只向"已启用且已连接"的适配器发送；任一适配器成功即视为本批成功，
//! 单个适配器的失败只记录日志，不向上传播。

mod factory;

pub use factory::build_adapters;

use domain::Measurement;
use gw_config::GatewayConfig;
use gw_protocol::ProtocolAdapter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no adapter initialized")]
    NoAdapters,
}

/// 单次分发的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 空批次，视为成功
    Empty,
    /// 至少一个适配器发送成功
    Delivered,
    /// 没有既启用又已连接的适配器，未尝试发送
    NoConnectedAdapters,
    /// 所有目标适配器均失败
    AllFailed,
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub outcome: DispatchOutcome,
    /// (协议键, 发送点数)
    pub delivered: Vec<(String, usize)>,
    /// (协议键, 错误描述)
    pub failed: Vec<(String, String)>,
}

impl DispatchReport {
    fn new(outcome: DispatchOutcome) -> Self {
        Self {
            outcome,
            delivered: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            DispatchOutcome::Empty | DispatchOutcome::Delivered
        )
    }
}

/// 单个适配器发送的默认超时
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// 持有活动适配器集合并负责扇出
pub struct ProtocolRouter {
    adapters: RwLock<Vec<Arc<dyn ProtocolAdapter>>>,
    /// 每个适配器单次 send 的上限，超时计为该适配器失败
    send_timeout: Duration,
}

impl Default for ProtocolRouter {
    fn default() -> Self {
        Self::with_send_timeout(DEFAULT_SEND_TIMEOUT)
    }
}

impl ProtocolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self {
            adapters: RwLock::new(Vec::new()),
            send_timeout: send_timeout.max(Duration::from_millis(1)),
        }
    }

    /// 按配置构建并初始化全部已启用的适配器。
    pub async fn initialize_from_config(&self, config: &GatewayConfig) -> Result<usize, RouterError> {
        self.initialize_all(build_adapters(config)).await
    }

    /// 并发初始化候选适配器；初始化失败的适配器记录错误后排除，不影响其他适配器。
    ///
    /// 新集合整体替换旧集合，不在新集合中的旧适配器会被断开。
    pub async fn initialize_all(
        &self,
        candidates: Vec<Arc<dyn ProtocolAdapter>>,
    ) -> Result<usize, RouterError> {
        let candidates: Vec<_> = candidates
            .into_iter()
            .filter(|adapter| {
                let enabled = adapter.is_enabled();
                if !enabled {
                    debug!(target: "gw.router", protocol = %adapter.key(), "adapter_disabled");
                }
                enabled
            })
            .collect();

        let results = futures::future::join_all(candidates.iter().map(|adapter| adapter.initialize())).await;

        let mut active = Vec::new();
        for (adapter, result) in candidates.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    info!(
                        target: "gw.router",
                        protocol = %adapter.key(),
                        connected = adapter.is_connected(),
                        "adapter_initialized"
                    );
                    active.push(adapter);
                }
                Err(err) => {
                    error!(target: "gw.router", protocol = %adapter.key(), error = %err, "adapter_initialize_failed");
                }
            }
        }

        let count = active.len();
        let previous = std::mem::replace(&mut *self.adapters.write().await, active.clone());
        let retired: Vec<_> = previous
            .into_iter()
            .filter(|old| !active.iter().any(|new| Arc::ptr_eq(old, new)))
            .collect();
        if !retired.is_empty() {
            futures::future::join_all(retired.iter().map(|adapter| adapter.disconnect())).await;
            info!(target: "gw.router", count = retired.len(), "adapters_replaced");
        }
        if count == 0 {
            return Err(RouterError::NoAdapters);
        }
        Ok(count)
    }

    /// 当前活动适配器（供连接监控与指标使用）
    pub async fn adapters(&self) -> Vec<Arc<dyn ProtocolAdapter>> {
        self.adapters.read().await.clone()
    }

    pub async fn dispatch(&self, batch: &[Measurement]) -> DispatchReport {
        if batch.is_empty() {
            return DispatchReport::new(DispatchOutcome::Empty);
        }

        let targets: Vec<_> = self
            .adapters
            .read()
            .await
            .iter()
            .filter(|adapter| adapter.is_enabled() && adapter.is_connected())
            .cloned()
            .collect();
        if targets.is_empty() {
            warn!(target: "gw.router", size = batch.len(), "dispatch_no_connected_adapter");
            return DispatchReport::new(DispatchOutcome::NoConnectedAdapters);
        }

        let shared: Arc<[Measurement]> = Arc::from(batch);
        let send_timeout = self.send_timeout;
        let mut tasks = JoinSet::new();
        for adapter in targets {
            let batch = Arc::clone(&shared);
            tasks.spawn(async move {
                let key = adapter.key().to_string();
                let result = match tokio::time::timeout(send_timeout, adapter.send(&batch)).await {
                    Ok(result) => result.map_err(|err| err.to_string()),
                    Err(_) => {
                        warn!(
                            target: "gw.router",
                            protocol = %key,
                            timeout_ms = send_timeout.as_millis() as u64,
                            "adapter_send_timeout"
                        );
                        Err(format!("send timed out after {} ms", send_timeout.as_millis()))
                    }
                };
                (key, result)
            });
        }

        let mut report = DispatchReport::new(DispatchOutcome::AllFailed);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Ok(count))) => {
                    debug!(target: "gw.router", protocol = %key, count, "adapter_send_ok");
                    report.delivered.push((key, count));
                }
                Ok((key, Err(err))) => {
                    warn!(target: "gw.router", protocol = %key, error = %err, "adapter_send_failed");
                    report.failed.push((key, err));
                }
                Err(err) => {
                    warn!(target: "gw.router", error = %err, "adapter_send_task_failed");
                    report.failed.push(("unknown".to_string(), err.to_string()));
                }
            }
        }

        if !report.delivered.is_empty() {
            report.outcome = DispatchOutcome::Delivered;
        } else {
            warn!(target: "gw.router", failed = report.failed.len(), "dispatch_failed");
        }
        report
    }

    /// 并发断开所有适配器并清空活动集合
    pub async fn stop_all(&self) {
        let adapters = std::mem::take(&mut *self.adapters.write().await);
        futures::future::join_all(adapters.iter().map(|adapter| adapter.disconnect())).await;
        info!(target: "gw.router", count = adapters.len(), "router_stopped");
    }
}
