//! 下行协议适配器抽象

use crate::error::ProtocolError;
use async_trait::async_trait;
use domain::Measurement;

/// MSA 二进制遥测协议
pub const MSA_KEY: &str = "msa";
/// MQTT 发布
pub const MQTT_KEY: &str = "mqtt";
/// Modbus TCP 寄存器服务
pub const MODBUS_TCP_KEY: &str = "modbusTcp";

/// 下行协议适配器。
///
/// 每个适配器独占自己的连接/会话与启用标志；路由只通过该 trait 与之交互。
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// 协议键（`msa` / `mqtt` / `modbusTcp`）。
    fn key(&self) -> &str;

    fn is_enabled(&self) -> bool;

    /// 当前连接状态（不做 I/O）。
    fn is_connected(&self) -> bool;

    /// 建立连接/会话。失败的适配器不会进入路由的活动集合。
    async fn initialize(&self) -> Result<(), ProtocolError>;

    /// 发送一批采集值，返回实际写出/发布的点位数。
    async fn send(&self, batch: &[Measurement]) -> Result<usize, ProtocolError>;

    async fn disconnect(&self);

    /// 重建连接，返回重连后是否处于连接状态。供连接监控调用。
    async fn reconnect(&self) -> Result<bool, ProtocolError>;
}
