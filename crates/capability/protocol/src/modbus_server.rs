//! Modbus TCP 寄存器服务适配器
//!
//! 在配置的地址/端口上运行 Modbus TCP 从站，采集值按映射写入保持寄存器，
//! 外部主站通过标准功能码读取。
//!
//! ## 寄存器编码
//!
//! | 类型 | 寄存器数 | 说明 |
//! |------|----------|------|
//! | bool | 1 | 0 / 1 |
//! | 整数 | 1 | 低 16 位 |
//! | f32 | 2 | 大端字序（高字在前） |
//! | f64 | 4 | 大端字序 |
//! | 字符串 | 2 | UTF-8 字节每寄存器两字节，超出截断 |

use crate::adapter::{MODBUS_TCP_KEY, ProtocolAdapter};
use crate::error::ProtocolError;
use async_trait::async_trait;
use domain::{Measurement, RegisterMap, TagValue};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_modbus::prelude::*;
use tokio_modbus::server::Service;
use tokio_modbus::server::tcp::{Server, accept_tcp_connection};
use tracing::{debug, info, warn};

/// 字符串编码占用的寄存器数
const STRING_REGISTERS: usize = 2;

/// 默认映射的寄存器步长（按 f64 的 4 个寄存器预留）
const DEFAULT_STRIDE: u16 = 4;

/// Modbus TCP 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModbusServerConfig {
    /// 监听地址
    #[serde(default = "default_listen_ip", alias = "host")]
    pub ip: String,
    /// 监听端口（默认 502）
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    /// 从站 ID
    #[serde(default = "default_station_id")]
    pub station_id: u8,
    /// 未配置映射时按顺序分配地址的 tag 列表
    #[serde(default)]
    pub default_tags: Vec<String>,
    /// 默认映射的起始地址
    #[serde(default)]
    pub start_address: u16,
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_modbus_port() -> u16 {
    502
}

fn default_station_id() -> u8 {
    1
}

impl ModbusServerConfig {
    /// 从 JSON 配置字符串解析
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::ConfigParse(e.to_string()))
    }

    fn bind_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// 类型驱动的寄存器编码
pub fn encode_registers(value: &TagValue) -> Vec<u16> {
    match value {
        TagValue::Bool(flag) => vec![u16::from(*flag)],
        TagValue::I64(number) => vec![*number as u16],
        TagValue::F32(number) => words(&number.to_be_bytes()),
        TagValue::F64(number) => words(&number.to_be_bytes()),
        TagValue::String(text) => {
            let mut bytes = text.as_bytes().to_vec();
            bytes.resize(STRING_REGISTERS * 2, 0);
            words(&bytes)
        }
    }
}

fn words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// 寄存器存储，采集写入与主站读写共享
#[derive(Debug, Default)]
pub struct RegisterStore {
    registers: RwLock<HashMap<u16, u16>>,
}

impl RegisterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 `address` 起连续写入，越过地址空间时整体拒绝
    pub fn write(&self, address: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        check_range(address, values.len())?;
        let mut registers = self
            .registers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for (offset, value) in values.iter().enumerate() {
            registers.insert(address + offset as u16, *value);
        }
        Ok(())
    }

    /// 读取连续寄存器，未写过的地址为 0
    pub fn read(&self, address: u16, count: u16) -> Result<Vec<u16>, ExceptionCode> {
        check_range(address, usize::from(count))?;
        let registers = self
            .registers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok((0..count)
            .map(|offset| registers.get(&(address + offset)).copied().unwrap_or(0))
            .collect())
    }

    pub fn get(&self, address: u16) -> Option<u16> {
        self.registers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .copied()
    }
}

fn check_range(address: u16, len: usize) -> Result<(), ExceptionCode> {
    if usize::from(address) + len > usize::from(u16::MAX) + 1 {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(())
}

/// 单个主站连接的请求处理
#[derive(Clone)]
struct RegisterService {
    store: Arc<RegisterStore>,
    station_id: u8,
}

impl RegisterService {
    fn accepts(&self, slave: SlaveId) -> bool {
        slave == self.station_id || slave == 0 || slave == 255
    }

    fn handle(&self, request: Request<'static>) -> Result<Response, ExceptionCode> {
        match request {
            Request::ReadHoldingRegisters(address, count) => self
                .store
                .read(address, count)
                .map(Response::ReadHoldingRegisters),
            Request::ReadInputRegisters(address, count) => self
                .store
                .read(address, count)
                .map(Response::ReadInputRegisters),
            Request::WriteSingleRegister(address, value) => self
                .store
                .write(address, &[value])
                .map(|_| Response::WriteSingleRegister(address, value)),
            Request::WriteMultipleRegisters(address, values) => self
                .store
                .write(address, &values)
                .map(|_| Response::WriteMultipleRegisters(address, values.len() as u16)),
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }
}

impl Service for RegisterService {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        if !self.accepts(req.slave) {
            debug!(target: "gw.modbus", slave = req.slave, "modbus_station_mismatch");
            return future::ready(Err(ExceptionCode::GatewayTargetDevice));
        }
        future::ready(self.handle(req.request))
    }
}

struct ServerHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Modbus TCP 寄存器服务适配器
pub struct ModbusServerAdapter {
    config: ModbusServerConfig,
    register_map: Arc<RegisterMap<u16>>,
    store: Arc<RegisterStore>,
    enabled: AtomicBool,
    running: Arc<AtomicBool>,
    server: Mutex<Option<ServerHandle>>,
}

impl ModbusServerAdapter {
    /// 映射为空时按 `default_tags` 从 `start_address` 起顺序分配地址
    pub fn new(config: ModbusServerConfig, register_map: RegisterMap<u16>) -> Self {
        let register_map = if register_map.is_empty() && !config.default_tags.is_empty() {
            RegisterMap::sequential(&config.default_tags, config.start_address, DEFAULT_STRIDE)
        } else {
            register_map
        };
        Self {
            config,
            register_map: Arc::new(register_map),
            store: Arc::new(RegisterStore::new()),
            enabled: AtomicBool::new(true),
            running: Arc::new(AtomicBool::new(false)),
            server: Mutex::new(None),
        }
    }

    pub fn store(&self) -> Arc<RegisterStore> {
        Arc::clone(&self.store)
    }

    pub fn register_map(&self) -> &RegisterMap<u16> {
        &self.register_map
    }

    /// 实际监听地址（端口 0 时由系统分配）
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|handle| handle.local_addr)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    async fn start(&self) -> Result<(), ProtocolError> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Ok(());
        }

        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| ProtocolError::Connection(format!("bind {}: {}", bind_addr, e)))?;
        let local_addr = listener.local_addr()?;

        let (stop, stopped) = oneshot::channel::<()>();
        let store = Arc::clone(&self.store);
        let station_id = self.config.station_id;
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        let task = tokio::spawn(async move {
            let on_connected = move |stream: TcpStream, socket_addr: SocketAddr| {
                let service = RegisterService {
                    store: Arc::clone(&store),
                    station_id,
                };
                async move {
                    debug!(target: "gw.modbus", peer = %socket_addr, "modbus_master_connected");
                    accept_tcp_connection(stream, socket_addr, move |_| Ok(Some(service.clone())))
                }
            };
            let on_process_error = |err: std::io::Error| {
                warn!(target: "gw.modbus", error = %err, "modbus_process_error");
            };
            let abort = stopped.map(|_| ());
            match Server::new(listener)
                .serve_until(&on_connected, on_process_error, abort)
                .await
            {
                Ok(_) => info!(target: "gw.modbus", addr = %local_addr, "modbus_server_stopped"),
                Err(err) => {
                    warn!(target: "gw.modbus", addr = %local_addr, error = %err, "modbus_server_failed")
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        info!(
            target: "gw.modbus",
            addr = %local_addr,
            station_id,
            tags = self.register_map.len(),
            "modbus_server_started"
        );
        *server = Some(ServerHandle {
            stop,
            task,
            local_addr,
        });
        Ok(())
    }

    async fn stop(&self) {
        let handle = self.server.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.stop.send(());
            let _ = handle.task.await;
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProtocolAdapter for ModbusServerAdapter {
    fn key(&self) -> &str {
        MODBUS_TCP_KEY
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> Result<(), ProtocolError> {
        self.start().await
    }

    async fn send(&self, batch: &[Measurement]) -> Result<usize, ProtocolError> {
        let mut written = 0;
        for measurement in batch {
            let Some(address) = self.register_map.get(&measurement.tag) else {
                warn!(target: "gw.modbus", tag = %measurement.tag, "modbus_tag_unmapped");
                continue;
            };
            let registers = encode_registers(&measurement.value);
            match self.store.write(*address, &registers) {
                Ok(()) => written += 1,
                Err(code) => warn!(
                    target: "gw.modbus",
                    tag = %measurement.tag,
                    address = *address,
                    exception = ?code,
                    "modbus_register_write_failed"
                ),
            }
        }
        debug!(target: "gw.modbus", written, "modbus_registers_written");
        Ok(written)
    }

    async fn disconnect(&self) {
        self.stop().await;
    }

    async fn reconnect(&self) -> Result<bool, ProtocolError> {
        self.stop().await;
        self.start().await?;
        Ok(self.is_connected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::Quality;
    use std::borrow::Cow;

    fn adapter_with(map: &[(&str, u16)]) -> ModbusServerAdapter {
        let config = ModbusServerConfig::from_json(r#"{"ip": "127.0.0.1", "port": 0}"#).unwrap();
        let map = map.iter().map(|(tag, address)| (tag.to_string(), *address)).collect();
        ModbusServerAdapter::new(config, map)
    }

    #[test]
    fn encode_bool_and_integer_use_one_register() {
        assert_eq!(encode_registers(&TagValue::Bool(true)), vec![1]);
        assert_eq!(encode_registers(&TagValue::Bool(false)), vec![0]);
        assert_eq!(encode_registers(&TagValue::I64(-2)), vec![0xFFFE]);
    }

    #[test]
    fn encode_floats_big_endian_words() {
        assert_eq!(encode_registers(&TagValue::F32(1.0)), vec![0x3F80, 0x0000]);
        assert_eq!(
            encode_registers(&TagValue::F64(1.0)),
            vec![0x3FF0, 0x0000, 0x0000, 0x0000]
        );
    }

    #[test]
    fn encode_string_truncates_to_two_registers() {
        assert_eq!(
            encode_registers(&TagValue::String("ABCDEF".to_string())),
            vec![0x4142, 0x4344]
        );
        assert_eq!(
            encode_registers(&TagValue::String("A".to_string())),
            vec![0x4100, 0x0000]
        );
    }

    #[test]
    fn store_rejects_writes_past_address_space() {
        let store = RegisterStore::new();
        assert_eq!(
            store.write(u16::MAX, &[1, 2]),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert!(store.write(u16::MAX, &[1]).is_ok());
        assert_eq!(store.read(10, 2).unwrap(), vec![0, 0]);
    }

    #[tokio::test]
    async fn bool_true_writes_one_to_mapped_register() {
        let adapter = adapter_with(&[("T1", 100)]);
        let batch = vec![Measurement::new("T1", TagValue::Bool(true), Quality::Good)];
        assert_eq!(adapter.send(&batch).await.unwrap(), 1);
        assert_eq!(adapter.store().get(100), Some(1));
    }

    #[tokio::test]
    async fn unmapped_tag_is_skipped() {
        let adapter = adapter_with(&[("T1", 10)]);
        let batch = vec![
            Measurement::new("T1", TagValue::F32(1.0), Quality::Good),
            Measurement::new("T2", TagValue::I64(5), Quality::Good),
        ];
        assert_eq!(adapter.send(&batch).await.unwrap(), 1);
        assert_eq!(adapter.store().read(10, 2).unwrap(), vec![0x3F80, 0x0000]);
    }

    #[test]
    fn default_tags_fill_sequential_map() {
        let config = ModbusServerConfig::from_json(
            r#"{"port": 0, "defaultTags": ["A", "B"], "startAddress": 40}"#,
        )
        .unwrap();
        let adapter = ModbusServerAdapter::new(config, RegisterMap::new());
        assert_eq!(adapter.register_map().get("A"), Some(&40));
        assert_eq!(adapter.register_map().get("B"), Some(&44));
    }

    #[test]
    fn service_checks_station_id() {
        let service = RegisterService {
            store: Arc::new(RegisterStore::new()),
            station_id: 3,
        };
        assert!(service.accepts(3));
        assert!(service.accepts(0));
        assert!(!service.accepts(4));
    }

    #[test]
    fn service_handles_register_requests() {
        let service = RegisterService {
            store: Arc::new(RegisterStore::new()),
            station_id: 1,
        };
        let written = service
            .handle(Request::WriteMultipleRegisters(5, Cow::Owned(vec![7, 8])))
            .unwrap();
        assert_eq!(written, Response::WriteMultipleRegisters(5, 2));
        let read = service.handle(Request::ReadHoldingRegisters(5, 2)).unwrap();
        assert_eq!(read, Response::ReadHoldingRegisters(vec![7, 8]));
        assert_eq!(
            service.handle(Request::ReadCoils(0, 1)),
            Err(ExceptionCode::IllegalFunction)
        );
    }
}
