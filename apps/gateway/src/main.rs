//! 工业协议网关：数据源采集 → 协议路由 → MSA / Modbus TCP / MQTT。

mod runtime;

use gw_config::{AppConfig, GatewayConfig};
use gw_router::{ProtocolRouter, RouterError};
use gw_telemetry::init_tracing;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;
    init_tracing();

    // 协议配置只在启动时加载并校验一次
    let mut gateway = GatewayConfig::load(&config.config_path)?;
    for problem in gateway.validate() {
        error!(target: "gw.config", error = %problem, "protocol_disabled");
    }
    info!(
        target: "gw.config",
        path = %config.config_path.display(),
        protocols = ?gateway.enabled_protocols(),
        "gateway_config_loaded"
    );

    let router = Arc::new(ProtocolRouter::with_send_timeout(Duration::from_millis(
        config.dispatch_timeout_ms,
    )));
    match router.initialize_from_config(&gateway).await {
        Ok(count) => info!(target: "gw.router", count, "router_ready"),
        // 没有可用适配器时仍保持运行，由数据源监控与指标继续工作
        Err(RouterError::NoAdapters) => warn!(target: "gw.router", "router_without_adapters"),
    }

    let runtime = runtime::start(&config, router).await;

    tokio::signal::ctrl_c().await?;
    info!("shutdown_requested");
    runtime.shutdown().await;
    Ok(())
}
