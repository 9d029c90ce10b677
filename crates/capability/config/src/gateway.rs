//! 协议配置文件。
//!
//! ```json
//! {
//!   "protocols": {
//!     "msa": { "enabled": true, "host": "10.0.0.5", "port": 9000, "heartbeatIntervalMs": 5000 },
//!     "modbusTcp": { "enabled": true, "ip": "0.0.0.0", "port": 502, "stationId": 1 },
//!     "mqtt": { "enabled": false, "brokerUrl": "mqtt://broker:1883", "dataTopic": "gw/data" }
//!   },
//!   "registerMaps": {
//!     "msa": { "T1": "C1" },
//!     "modbusTcp": { "T1": 100 }
//!   }
//! }
//! ```
//!
//! 单个协议段解析或校验失败时只禁用该协议，其余协议照常启动。

use crate::ConfigError;
use domain::RegisterMap;
use gw_protocol::{
    MODBUS_TCP_KEY, MQTT_KEY, MSA_KEY, ModbusServerConfig, MqttPublisherConfig, MsaClientConfig,
    parse_broker_url,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{error, warn};

/// 单个协议的配置段：启用标志 + 该协议的类型化配置。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSection<T> {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub settings: T,
}

fn default_enabled() -> bool {
    true
}

impl<T> ProtocolSection<T> {
    pub fn new(settings: T) -> Self {
        Self {
            enabled: true,
            settings,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProtocolsConfig {
    pub msa: Option<ProtocolSection<MsaClientConfig>>,
    pub modbus_tcp: Option<ProtocolSection<ModbusServerConfig>>,
    pub mqtt: Option<ProtocolSection<MqttPublisherConfig>>,
}

/// 各协议的 tag 映射表。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterMaps {
    pub msa: RegisterMap<String>,
    pub modbus_tcp: RegisterMap<u16>,
    pub mqtt: RegisterMap<String>,
}

impl RegisterMaps {
    /// MQTT 未单独配置映射时沿用 MSA 的编码。
    pub fn mqtt_codes(&self) -> RegisterMap<String> {
        if self.mqtt.is_empty() {
            self.msa.clone()
        } else {
            self.mqtt.clone()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub protocols: ProtocolsConfig,
    pub register_maps: RegisterMaps,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGatewayConfig {
    #[serde(default)]
    protocols: Map<String, Value>,
    #[serde(default)]
    register_maps: RegisterMaps,
}

impl GatewayConfig {
    /// 读取并解析配置文件。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: RawGatewayConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut protocols = ProtocolsConfig::default();
        for (key, value) in raw.protocols {
            match key.as_str() {
                MSA_KEY => protocols.msa = parse_section(&key, value),
                MODBUS_TCP_KEY => protocols.modbus_tcp = parse_section(&key, value),
                MQTT_KEY => protocols.mqtt = parse_section(&key, value),
                _ => warn!(target: "gw.config", protocol = %key, "protocol_unknown"),
            }
        }

        Ok(Self {
            protocols,
            register_maps: raw.register_maps,
        })
    }

    /// 启动时校验一次；不合法的协议被禁用并返回对应错误。
    pub fn validate(&mut self) -> Vec<ConfigError> {
        let mut problems = Vec::new();
        check_section(MSA_KEY, &mut self.protocols.msa, check_msa, &mut problems);
        check_section(
            MODBUS_TCP_KEY,
            &mut self.protocols.modbus_tcp,
            check_modbus,
            &mut problems,
        );
        check_section(MQTT_KEY, &mut self.protocols.mqtt, check_mqtt, &mut problems);
        problems
    }

    /// 已启用的协议键。
    pub fn enabled_protocols(&self) -> Vec<&'static str> {
        let mut keys = Vec::new();
        if self.protocols.msa.as_ref().is_some_and(|s| s.enabled) {
            keys.push(MSA_KEY);
        }
        if self.protocols.modbus_tcp.as_ref().is_some_and(|s| s.enabled) {
            keys.push(MODBUS_TCP_KEY);
        }
        if self.protocols.mqtt.as_ref().is_some_and(|s| s.enabled) {
            keys.push(MQTT_KEY);
        }
        keys
    }
}

fn parse_section<T: DeserializeOwned>(key: &str, value: Value) -> Option<ProtocolSection<T>> {
    match serde_json::from_value(value) {
        Ok(section) => Some(section),
        Err(err) => {
            error!(target: "gw.config", protocol = %key, error = %err, "protocol_config_invalid");
            None
        }
    }
}

fn check_section<T>(
    key: &str,
    section: &mut Option<ProtocolSection<T>>,
    check: fn(&T) -> Result<(), String>,
    problems: &mut Vec<ConfigError>,
) {
    let Some(section) = section.as_mut().filter(|section| section.enabled) else {
        return;
    };
    if let Err(reason) = check(&section.settings) {
        error!(target: "gw.config", protocol = %key, reason = %reason, "protocol_disabled");
        section.enabled = false;
        problems.push(ConfigError::Invalid(format!("protocols.{}", key), reason));
    }
}

fn check_msa(settings: &MsaClientConfig) -> Result<(), String> {
    settings.validate().map_err(|e| e.to_string())
}

fn check_modbus(settings: &ModbusServerConfig) -> Result<(), String> {
    if settings.ip.trim().is_empty() {
        return Err("listen ip is empty".to_string());
    }
    if settings.port == 0 {
        return Err("port is 0".to_string());
    }
    if !(1..=247).contains(&settings.station_id) {
        return Err(format!("station id {} out of 1..=247", settings.station_id));
    }
    Ok(())
}

fn check_mqtt(settings: &MqttPublisherConfig) -> Result<(), String> {
    parse_broker_url(&settings.broker_url).map_err(|e| e.to_string())?;
    if settings.data_topic.trim().is_empty() {
        return Err("data topic is empty".to_string());
    }
    if settings.qos > 2 {
        return Err(format!("qos {} out of 0..=2", settings.qos));
    }
    Ok(())
}
