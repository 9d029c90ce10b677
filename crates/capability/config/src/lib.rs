//! 网关运行配置加载。
//!
//! - [`AppConfig`]：环境变量中的运行参数（周期、超时、数据源）
//! - [`GatewayConfig`]：JSON 文件中的协议配置与点位映射

mod gateway;

pub use gateway::{GatewayConfig, ProtocolSection, ProtocolsConfig, RegisterMaps};

use std::env;
use std::path::PathBuf;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(String),
}

/// 数据源类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// 模拟数据源（周期生成测试数据）
    Simulated,
    /// 空数据源（只验证下行链路）
    Noop,
}

/// 应用运行配置。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_path: PathBuf,
    pub monitor_tick_ms: u64,
    pub reconnect_timeout_ms: u64,
    /// 路由分发时单个适配器 send 的超时
    pub dispatch_timeout_ms: u64,
    pub metrics_sample_ms: u64,
    pub metrics_push_ms: u64,
    pub poll_interval_ms: u64,
    pub source: SourceKind,
    pub source_tags: Vec<String>,
}

impl AppConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("GW_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("gateway.json"));
        let monitor_tick_ms = read_interval_ms("GW_MONITOR_TICK_MS", 1000)?;
        let reconnect_timeout_ms = read_interval_ms("GW_RECONNECT_TIMEOUT_MS", 10_000)?;
        let dispatch_timeout_ms = read_interval_ms("GW_DISPATCH_TIMEOUT_MS", 10_000)?;
        let metrics_sample_ms = read_interval_ms("GW_METRICS_SAMPLE_MS", 1000)?;
        let metrics_push_ms = read_interval_ms("GW_METRICS_PUSH_MS", 2000)?;
        let poll_interval_ms = read_interval_ms("GW_POLL_INTERVAL_MS", 1000)?;
        let source = read_source_kind("GW_SOURCE")?;
        let source_tags = read_list_with_default("GW_SOURCE_TAGS", &["T1", "T2", "T3"]);

        Ok(Self {
            config_path,
            monitor_tick_ms,
            reconnect_timeout_ms,
            dispatch_timeout_ms,
            metrics_sample_ms,
            metrics_push_ms,
            poll_interval_ms,
            source,
            source_tags,
        })
    }
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

/// 周期类参数不允许为 0。
fn read_interval_ms(key: &str, default: u64) -> Result<u64, ConfigError> {
    match read_u64_with_default(key, default)? {
        0 => Err(ConfigError::Invalid(key.to_string(), "0".to_string())),
        value => Ok(value),
    }
}

fn read_source_kind(key: &str) -> Result<SourceKind, ConfigError> {
    match env::var(key) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "simulated" | "sim" => Ok(SourceKind::Simulated),
            "noop" | "none" => Ok(SourceKind::Noop),
            _ => Err(ConfigError::Invalid(key.to_string(), value)),
        },
        Err(_) => Ok(SourceKind::Simulated),
    }
}

fn read_list_with_default(key: &str, default: &[&str]) -> Vec<String> {
    let parsed: Vec<String> = env::var(key)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if parsed.is_empty() {
        default.iter().map(|item| item.to_string()).collect()
    } else {
        parsed
    }
}
