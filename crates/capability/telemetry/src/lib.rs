//! 追踪初始化与运行指标。
//!
//! ```text
//! MetricsSampler ──每 sample 周期写入──▶ MetricsRegistry ◀──每 push 周期读取── MetricsPublisher
//!   (sysinfo + 监控快照)                 (name → MetricSample)                   (broadcast)
//! ```

mod publisher;
mod registry;
mod sampler;

pub use publisher::{MetricsEvent, MetricsPublisher};
pub use registry::MetricsRegistry;
pub use sampler::MetricsSampler;

use tracing_subscriber::{EnvFilter, fmt};

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
