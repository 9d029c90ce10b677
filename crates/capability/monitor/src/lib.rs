//! 连接监控与自动重连。
//!
//! 每个对外连接（数据源、各下行适配器）对应一个 [`ConnectionMonitor`]，
//! 由 [`MonitorScheduler`] 按固定周期顺序驱动：
//!
//! ```text
//! tick ──▶ 已连接？──是──▶ 记录 last_ok，退避复位
//!             │否
//!             ▼
//!        重连暂停？──是──▶ 跳过
//!             │否
//!             ▼
//!   重连进行中 / 距上次尝试 < 2s / 退避未到期 ──▶ 跳过
//!             │
//!             ▼
//!   后台发起重连（带超时），结果在后续 tick 中处理
//! ```
//!
//! 重连在独立任务中执行，单个连接的阻塞重连不会拖住其他监控的 tick。

mod monitor;
mod scheduler;
mod target;

pub use monitor::{ConnectionMonitor, ConnectionMonitorState, MonitorSettings, TickOutcome};
pub use scheduler::{MonitorScheduler, ReconnectGate};
pub use target::{AdapterTarget, MonitorTarget};

#[derive(Debug, Clone, thiserror::Error)]
pub enum MonitorError {
    #[error("reconnect failed: {0}")]
    Reconnect(String),
    #[error("reconnect timed out after {0} ms")]
    Timeout(u64),
}
