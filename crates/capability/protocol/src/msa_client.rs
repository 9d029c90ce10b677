//! MSA 二进制遥测客户端
//!
//! 主动连接远端遥测服务器，周期发送心跳并上报模板数据。
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected(心跳 + 接收)
//!      ▲                        │                     │
//!      └────────失败────────────┘◀──────I/O 错误──────┘
//! ```
//!
//! 首次连接失败时按心跳间隔重试，直到第一次连接成功；此后的断线由连接监控负责重连。
//! 所有连接动作共用同一把连接锁，已连接时再次连接为空操作。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let config = MsaClientConfig::from_json(r#"{"host": "10.0.0.5", "port": 9000}"#)?;
//! let client = MsaClient::new(config, Arc::new(register_map));
//! client.initialize().await?;
//! client.send(&batch).await?;
//! ```

use crate::adapter::{MSA_KEY, ProtocolAdapter};
use crate::codec::{self, Frame, FrameBody, MsaCodec, RawFrame, TEMPLATE_DATA_LEVEL, TemplateData};
use crate::error::ProtocolError;
use async_trait::async_trait;
use chrono::{Local, Utc};
use domain::{Measurement, RegisterMap};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// MSA 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsaClientConfig {
    /// 遥测服务器地址
    #[serde(alias = "ip")]
    pub host: String,
    /// 遥测服务器端口
    #[serde(default = "default_msa_port")]
    pub port: u16,
    /// 心跳间隔（毫秒），同时作为首次连接的重试间隔
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// 连接超时（毫秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// 单帧写出超时（毫秒），超时视为链路失效
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
    /// 网关 ID（gid）
    #[serde(default)]
    pub gateway_id: String,
    /// 通道 ID（cid）
    #[serde(default)]
    pub channel_id: String,
    /// 模板 ID（ptid）
    #[serde(default)]
    pub template_id: String,
}

fn default_msa_port() -> u16 {
    9000
}

fn default_heartbeat_interval() -> u64 {
    5000
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_send_timeout() -> u64 {
    5000
}

impl MsaClientConfig {
    /// 从 JSON 配置字符串解析
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::ConfigParse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.host.trim().is_empty() {
            return Err(ProtocolError::ConfigParse("msa host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(ProtocolError::ConfigParse("msa port is 0".to_string()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ProtocolError::ConfigParse(
                "msa heartbeat interval is 0".to_string(),
            ));
        }
        if self.send_timeout_ms == 0 {
            return Err(ProtocolError::ConfigParse("msa send timeout is 0".to_string()));
        }
        Ok(())
    }
}

/// 链路状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    fn as_u8(self) -> u8 {
        match self {
            LinkState::Disconnected => 0,
            LinkState::Connecting => 1,
            LinkState::Connected => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }
}

/// 按映射表构建 TemplateData 的 points；未映射的 tag 记录告警后丢弃。
pub fn template_points(
    register_map: &RegisterMap<String>,
    batch: &[Measurement],
) -> BTreeMap<String, Value> {
    let mut points = BTreeMap::new();
    for measurement in batch {
        match register_map.get(&measurement.tag) {
            Some(code) => {
                points.insert(code.clone(), measurement.value.to_json());
            }
            None => {
                warn!(target: "gw.msa", tag = %measurement.tag, "msa_tag_unmapped");
            }
        }
    }
    points
}

/// MSA 遥测客户端
#[derive(Clone)]
pub struct MsaClient {
    inner: Arc<MsaInner>,
}

struct MsaInner {
    config: MsaClientConfig,
    register_map: Arc<RegisterMap<String>>,
    enabled: AtomicBool,
    state: AtomicU8,
    /// 远端在 Pong 中分配的会话 uid，重连后归零
    uid: AtomicU32,
    serial: AtomicU32,
    /// 每次连接成功递增，旧链路的循环据此判断是否仍为当前链路
    generation: AtomicU64,
    writer: Mutex<Option<OwnedWriteHalf>>,
    link: Mutex<Option<CancellationToken>>,
    connect_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl MsaClient {
    pub fn new(config: MsaClientConfig, register_map: Arc<RegisterMap<String>>) -> Self {
        Self {
            inner: Arc::new(MsaInner {
                config,
                register_map,
                enabled: AtomicBool::new(true),
                state: AtomicU8::new(LinkState::Disconnected.as_u8()),
                uid: AtomicU32::new(0),
                serial: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                writer: Mutex::new(None),
                link: Mutex::new(None),
                connect_lock: Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &MsaClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LinkState {
        self.inner.state()
    }

    /// 当前会话 uid（未收到 Pong 时为 0）
    pub fn session_uid(&self) -> u32 {
        self.inner.uid.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// 连接过程中被取消（例如外层超时丢弃 future）时，把 Connecting 退回 Disconnected。
struct ConnectingGuard<'a> {
    inner: &'a MsaInner,
    armed: bool,
}

impl<'a> ConnectingGuard<'a> {
    fn new(inner: &'a MsaInner) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.inner.state() == LinkState::Connecting {
            self.inner.set_state(LinkState::Disconnected);
        }
    }
}

impl MsaInner {
    fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.config.heartbeat_interval_ms.max(1))
    }

    fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    async fn connect(self: &Arc<Self>) -> Result<(), ProtocolError> {
        let _guard = self.connect_lock.lock().await;
        self.connect_locked().await
    }

    /// 关闭当前链路并重新连接
    async fn relink(self: &Arc<Self>) -> Result<(), ProtocolError> {
        let _guard = self.connect_lock.lock().await;
        self.close_link().await;
        self.connect_locked().await
    }

    async fn connect_locked(self: &Arc<Self>) -> Result<(), ProtocolError> {
        if self.state() == LinkState::Connected {
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            return Err(ProtocolError::Connection("msa client stopped".to_string()));
        }

        let addr = self.addr();
        self.set_state(LinkState::Connecting);
        let pending = ConnectingGuard::new(self);
        debug!(target: "gw.msa", addr = %addr, "msa_connecting");

        let timeout = Duration::from_millis(self.config.connect_timeout_ms.max(1));
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(ProtocolError::Connection(format!("{}: {}", addr, err)));
            }
            Err(_) => {
                return Err(ProtocolError::Timeout(format!("connect {}", addr)));
            }
        };
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let link = self.shutdown.child_token();
        *self.writer.lock().await = Some(writer);
        if let Some(previous) = self.link.lock().await.replace(link.clone()) {
            previous.cancel();
        }
        self.uid.store(0, Ordering::SeqCst);
        pending.disarm();
        self.set_state(LinkState::Connected);
        info!(target: "gw.msa", addr = %addr, generation, "msa_connected");

        tokio::spawn(heartbeat_loop(Arc::clone(self), generation, link.clone()));
        tokio::spawn(receive_loop(Arc::clone(self), reader, generation, link));
        Ok(())
    }

    async fn close_link(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.cancel();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.uid.store(0, Ordering::SeqCst);
        self.set_state(LinkState::Disconnected);
    }

    /// 仅当 `generation` 仍是当前链路时关闭，旧链路的循环退出不影响新连接。
    async fn lose_link(&self, generation: u64) {
        let _guard = self.connect_lock.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation
            || self.state() != LinkState::Connected
        {
            return;
        }
        warn!(target: "gw.msa", addr = %self.addr(), generation, "msa_link_lost");
        self.close_link().await;
    }

    /// 零字节非阻塞探测
    async fn probe(&self) -> bool {
        if self.state() != LinkState::Connected {
            return false;
        }
        let guard = self.writer.lock().await;
        match guard.as_ref() {
            Some(writer) => match writer.try_write(&[]) {
                Ok(_) => true,
                Err(err) => err.kind() == std::io::ErrorKind::WouldBlock,
            },
            None => false,
        }
    }

    /// 写出一帧；等待写锁与写出共用 `send_timeout_ms` 超时。
    async fn write_frame(&self, body: FrameBody) -> Result<(), ProtocolError> {
        let frame = Frame::new(self.uid.load(Ordering::SeqCst), self.next_serial(), body);
        let bytes = codec::encode(&frame)?;
        let timeout = Duration::from_millis(self.config.send_timeout_ms.max(1));
        let write = async {
            let mut guard = self.writer.lock().await;
            let writer = guard
                .as_mut()
                .ok_or_else(|| ProtocolError::NotConnected(self.addr()))?;
            writer.write_all(&bytes).await?;
            Ok::<(), ProtocolError>(())
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(format!(
                "write {} bytes to {}",
                bytes.len(),
                self.addr()
            ))),
        }
    }

    fn handle_raw(&self, raw: RawFrame) {
        let frame = match raw.into_frame() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: "gw.msa", error = %err, "msa_frame_malformed");
                return;
            }
        };
        match frame.body {
            FrameBody::Pong { msg } => {
                self.uid.store(frame.uid, Ordering::SeqCst);
                debug!(target: "gw.msa", uid = frame.uid, msg = ?msg, "msa_pong_received");
            }
            FrameBody::DeviceNotRegistered { msg } => {
                warn!(
                    target: "gw.msa",
                    gateway_id = %self.config.gateway_id,
                    msg = ?msg,
                    "msa_device_not_registered"
                );
            }
            other => {
                debug!(target: "gw.msa", func = other.func(), "msa_frame_ignored");
            }
        }
    }
}

async fn heartbeat_loop(inner: Arc<MsaInner>, generation: u64, link: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = link.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = inner.write_frame(FrameBody::Ping).await {
                    warn!(target: "gw.msa", generation, error = %err, "msa_heartbeat_failed");
                    inner.lose_link(generation).await;
                    break;
                }
            }
        }
    }
}

async fn receive_loop(
    inner: Arc<MsaInner>,
    reader: OwnedReadHalf,
    generation: u64,
    link: CancellationToken,
) {
    let mut frames = FramedRead::new(reader, MsaCodec::default());
    loop {
        tokio::select! {
            _ = link.cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(raw)) => inner.handle_raw(raw),
                Some(Err(err)) => {
                    warn!(target: "gw.msa", generation, error = %err, "msa_receive_failed");
                    inner.lose_link(generation).await;
                    break;
                }
                None => {
                    info!(target: "gw.msa", generation, "msa_peer_closed");
                    inner.lose_link(generation).await;
                    break;
                }
            }
        }
    }
}

/// 首次连接失败后的重试循环，间隔为心跳间隔，连接成功即退出
async fn initial_connect_loop(inner: Arc<MsaInner>) {
    let delay = inner.heartbeat_interval();
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        if inner.state() == LinkState::Connected {
            return;
        }
        match inner.connect().await {
            Ok(()) => return,
            Err(err) => {
                warn!(target: "gw.msa", addr = %inner.addr(), error = %err, "msa_connect_retry_failed");
            }
        }
    }
}

fn collection_elapsed_ms(batch: &[Measurement]) -> u64 {
    batch
        .iter()
        .map(|measurement| measurement.timestamp)
        .min()
        .map(|oldest| (Utc::now() - oldest).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}

#[async_trait]
impl ProtocolAdapter for MsaClient {
    fn key(&self) -> &str {
        MSA_KEY
    }

    fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.inner.state() == LinkState::Connected
    }

    async fn initialize(&self) -> Result<(), ProtocolError> {
        self.inner.config.validate()?;
        match self.inner.connect().await {
            Ok(()) => {}
            Err(err) => {
                warn!(
                    target: "gw.msa",
                    addr = %self.inner.addr(),
                    retry_ms = self.inner.config.heartbeat_interval_ms,
                    error = %err,
                    "msa_initial_connect_failed"
                );
                tokio::spawn(initial_connect_loop(Arc::clone(&self.inner)));
            }
        }
        Ok(())
    }

    async fn send(&self, batch: &[Measurement]) -> Result<usize, ProtocolError> {
        let points = template_points(&self.inner.register_map, batch);
        if points.is_empty() {
            return Ok(0);
        }

        if !self.inner.probe().await {
            warn!(target: "gw.msa", addr = %self.inner.addr(), "msa_link_unusable");
            self.inner.relink().await?;
        }

        let count = points.len();
        let config = &self.inner.config;
        let data = TemplateData {
            gid: config.gateway_id.clone(),
            ptid: config.template_id.clone(),
            cid: config.channel_id.clone(),
            time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            consume: collection_elapsed_ms(batch),
            err: 0,
            level: TEMPLATE_DATA_LEVEL,
            points,
        };
        let generation = self.inner.generation.load(Ordering::SeqCst);
        if let Err(err) = self.inner.write_frame(FrameBody::TemplateData(data)).await {
            self.inner.lose_link(generation).await;
            return Err(err);
        }
        debug!(target: "gw.msa", points = count, "msa_template_sent");
        Ok(count)
    }

    async fn disconnect(&self) {
        self.inner.shutdown.cancel();
        let _guard = self.inner.connect_lock.lock().await;
        self.inner.close_link().await;
        info!(target: "gw.msa", addr = %self.inner.addr(), "msa_disconnected");
    }

    async fn reconnect(&self) -> Result<bool, ProtocolError> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(false);
        }
        self.inner.relink().await?;
        Ok(self.is_connected())
    }
}
