use gw_config::{AppConfig, ConfigError, GatewayConfig, SourceKind};
use std::io::Write;

// 环境变量是进程级状态，相关断言放在同一个测试里顺序执行。
#[test]
fn load_config_from_env() {
    // Rust 2024 中 set_var 需要显式标注 unsafe（测试进程内可控）。
    unsafe {
        std::env::set_var("GW_CONFIG_PATH", "/etc/gw/gateway.json");
        std::env::set_var("GW_MONITOR_TICK_MS", "500");
        std::env::set_var("GW_SOURCE", "noop");
        std::env::set_var("GW_SOURCE_TAGS", "A, B,,C");
    }

    let config = AppConfig::from_env().expect("config");
    assert_eq!(config.config_path.to_str(), Some("/etc/gw/gateway.json"));
    assert_eq!(config.monitor_tick_ms, 500);
    assert_eq!(config.reconnect_timeout_ms, 10_000);
    assert_eq!(config.dispatch_timeout_ms, 10_000);
    assert_eq!(config.metrics_push_ms, 2000);
    assert_eq!(config.source, SourceKind::Noop);
    assert_eq!(config.source_tags, vec!["A", "B", "C"]);

    unsafe {
        std::env::set_var("GW_POLL_INTERVAL_MS", "0");
    }
    assert!(matches!(
        AppConfig::from_env(),
        Err(ConfigError::Invalid(key, _)) if key == "GW_POLL_INTERVAL_MS"
    ));

    unsafe {
        std::env::remove_var("GW_POLL_INTERVAL_MS");
        std::env::set_var("GW_DISPATCH_TIMEOUT_MS", "0");
    }
    assert!(matches!(
        AppConfig::from_env(),
        Err(ConfigError::Invalid(key, _)) if key == "GW_DISPATCH_TIMEOUT_MS"
    ));

    unsafe {
        std::env::remove_var("GW_DISPATCH_TIMEOUT_MS");
        std::env::set_var("GW_SOURCE", "opc");
    }
    assert!(AppConfig::from_env().is_err());
}

#[test]
fn load_gateway_file() {
    let path = std::env::temp_dir().join(format!("gw-config-{}.json", std::process::id()));
    let mut file = std::fs::File::create(&path).expect("create");
    file.write_all(
        br#"{"protocols": {"msa": {"host": "127.0.0.1", "port": 9000}},
             "registerMaps": {"msa": {"T1": "C1"}}}"#,
    )
    .expect("write");

    let config = GatewayConfig::load(&path).expect("load");
    assert_eq!(config.register_maps.msa.len(), 1);
    assert!(config.protocols.msa.is_some());
    std::fs::remove_file(&path).ok();
}

#[test]
fn missing_gateway_file_is_io_error() {
    let result = GatewayConfig::load("/nonexistent/gateway.json");
    assert!(matches!(result, Err(ConfigError::Io { .. })));
}
