//! 按配置构建适配器

use gw_config::GatewayConfig;
use gw_protocol::{ModbusServerAdapter, MqttAdapter, MsaClient, ProtocolAdapter};
use std::sync::Arc;

/// 为每个已启用的协议段构建适配器（尚未初始化）。
pub fn build_adapters(config: &GatewayConfig) -> Vec<Arc<dyn ProtocolAdapter>> {
    let mut adapters: Vec<Arc<dyn ProtocolAdapter>> = Vec::new();
    let maps = &config.register_maps;

    if let Some(section) = config.protocols.msa.as_ref().filter(|s| s.enabled) {
        adapters.push(Arc::new(MsaClient::new(
            section.settings.clone(),
            Arc::new(maps.msa.clone()),
        )));
    }
    if let Some(section) = config.protocols.modbus_tcp.as_ref().filter(|s| s.enabled) {
        adapters.push(Arc::new(ModbusServerAdapter::new(
            section.settings.clone(),
            maps.modbus_tcp.clone(),
        )));
    }
    if let Some(section) = config.protocols.mqtt.as_ref().filter(|s| s.enabled) {
        adapters.push(Arc::new(MqttAdapter::new(
            section.settings.clone(),
            Arc::new(maps.mqtt_codes()),
        )));
    }
    adapters
}
