//! # 下行协议能力模块
//!
//! 同一批采集值通过多种协议转发到下游系统：
//! - **MSA**：自定义二进制遥测协议（16 字节大端报文头 + JSON 报文体）
//! - **Modbus TCP**：本地寄存器服务，供外部主站读取
//! - **MQTT**：JSON 文档发布到 broker
//!
//! ## 架构设计
//!
//! ```text
//! 数据源批次 (Measurement[])
//!       │
//!       ▼
//! ProtocolRouter（gw-router）
//!       │
//!       ├── MsaClient ──── codec（FrameHeader + FrameBody）──▶ 遥测服务器
//!       ├── ModbusServerAdapter ── RegisterStore ◀── Modbus 主站
//!       └── MqttAdapter ──────────────────────────▶ MQTT broker
//! ```
//!
//! 各适配器实现 [`ProtocolAdapter`]，独占自己的连接与启用标志。
//!
//! ## 配置格式
//!
//! ### MSA
//! ```json
//! { "host": "10.0.0.5", "port": 9000, "heartbeatIntervalMs": 5000,
//!   "gatewayId": "gw-01", "channelId": "ch-01", "templateId": "tpl-01" }
//! ```
//!
//! ### Modbus TCP
//! ```json
//! { "ip": "0.0.0.0", "port": 502, "stationId": 1, "defaultTags": ["T1"], "startAddress": 0 }
//! ```
//!
//! ### MQTT
//! ```json
//! { "brokerUrl": "mqtt://broker:1883", "dataTopic": "gw/data", "statusTopic": "gw/status",
//!   "qos": 1, "retain": false, "deviceId": "gw-01" }
//! ```

mod adapter;
pub mod codec;
mod error;
mod modbus_server;
mod mqtt;
mod msa_client;

pub use adapter::{MODBUS_TCP_KEY, MQTT_KEY, MSA_KEY, ProtocolAdapter};
pub use codec::{Frame, FrameBody, FrameHeader, FuncCode, MsaCodec, RawFrame, TemplateData};
pub use error::{CodecError, ProtocolError};
pub use modbus_server::{ModbusServerAdapter, ModbusServerConfig, RegisterStore, encode_registers};
pub use mqtt::{
    BrokerEndpoint, DataPoint, MqttAdapter, MqttPayload, MqttPublisherConfig, UNREGISTERED_CODE,
    build_payload, parse_broker_url,
};
pub use msa_client::{LinkState, MsaClient, MsaClientConfig, template_points};
