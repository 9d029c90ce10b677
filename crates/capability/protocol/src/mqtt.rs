//! MQTT 发布适配器
//!
//! 每批采集值序列化为一个 JSON 文档发布到数据 topic：
//!
//! ```json
//! {
//!   "timestamp": "2025-01-01T00:00:00.000Z",
//!   "deviceId": "gw-01",
//!   "dataPoints": [
//!     {"tag": "T1", "code": "C1", "value": 42.0, "quality": "Good", "timestamp": "..."},
//!     {"tag": "T9", "code": "UNREGISTERED", "value": true, "quality": "Good", "timestamp": "..."}
//!   ]
//! }
//! ```
//!
//! 与 MSA/Modbus 不同，未映射的 tag 仍会发布，编码为 `UNREGISTERED`。
//! 配置了 `statusTopic` 时，连接成功后发布保留的 online 状态，遗嘱消息为 offline。

use crate::adapter::{MQTT_KEY, ProtocolAdapter};
use crate::error::ProtocolError;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use domain::{Measurement, RegisterMap};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, LastWill, MqttOptions, Outgoing, Packet, QoS,
    Transport,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 未映射 tag 的编码
pub const UNREGISTERED_CODE: &str = "UNREGISTERED";

const EVENTLOOP_CAPACITY: usize = 64;

/// MQTT 发布配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttPublisherConfig {
    /// `mqtt://host:port` 或 `mqtts://host:port`
    pub broker_url: String,
    /// 为空时自动生成
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub data_topic: String,
    #[serde(default)]
    pub status_topic: Option<String>,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub device_id: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// 等待 ConnAck 的超时（毫秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    5000
}

impl MqttPublisherConfig {
    /// 从 JSON 配置字符串解析
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::ConfigParse(e.to_string()))
    }

    fn status_topic(&self) -> Option<&str> {
        self.status_topic
            .as_deref()
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
    }
}

/// Broker 地址解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// 解析 broker URL：`mqtt://` 默认 1883，`mqtts://` 默认 8883 且启用 TLS
pub fn parse_broker_url(raw: &str) -> Result<BrokerEndpoint, ProtocolError> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| ProtocolError::ConfigParse(format!("broker url {}: {}", raw, e)))?;
    let (tls, default_port) = match parsed.scheme() {
        "mqtt" | "tcp" => (false, 1883),
        "mqtts" | "ssl" => (true, 8883),
        other => {
            return Err(ProtocolError::ConfigParse(format!(
                "unsupported broker scheme: {}",
                other
            )));
        }
    };
    let host = parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ProtocolError::ConfigParse(format!("broker url {} has no host", raw)))?;
    Ok(BrokerEndpoint {
        host: host.to_string(),
        port: parsed.port().unwrap_or(default_port),
        tls,
    })
}

fn qos_from_u8(value: u8) -> QoS {
    match value {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 发布的数据文档
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttPayload {
    pub timestamp: String,
    pub device_id: String,
    pub data_points: Vec<DataPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataPoint {
    pub tag: String,
    pub code: String,
    pub value: Value,
    pub quality: &'static str,
    pub timestamp: String,
}

/// 构建发布文档，未映射 tag 的 code 为 [`UNREGISTERED_CODE`]
pub fn build_payload(
    device_id: &str,
    register_map: &RegisterMap<String>,
    batch: &[Measurement],
) -> MqttPayload {
    let data_points = batch
        .iter()
        .map(|measurement| {
            let code = match register_map.get(&measurement.tag) {
                Some(code) => code.clone(),
                None => {
                    debug!(target: "gw.mqtt", tag = %measurement.tag, "mqtt_tag_unregistered");
                    UNREGISTERED_CODE.to_string()
                }
            };
            DataPoint {
                tag: measurement.tag.clone(),
                code,
                value: measurement.value.to_json(),
                quality: measurement.quality.as_str(),
                timestamp: format_timestamp(&measurement.timestamp),
            }
        })
        .collect();
    MqttPayload {
        timestamp: format_timestamp(&Utc::now()),
        device_id: device_id.to_string(),
        data_points,
    }
}

fn status_payload(device_id: &str, status: &str) -> Vec<u8> {
    serde_json::json!({
        "deviceId": device_id,
        "status": status,
        "timestamp": format_timestamp(&Utc::now()),
    })
    .to_string()
    .into_bytes()
}

struct MqttSession {
    client: AsyncClient,
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

/// MQTT 发布适配器
pub struct MqttAdapter {
    config: MqttPublisherConfig,
    register_map: Arc<RegisterMap<String>>,
    enabled: AtomicBool,
    connected: Arc<watch::Sender<bool>>,
    session: Mutex<Option<MqttSession>>,
    shutdown: CancellationToken,
}

impl MqttAdapter {
    pub fn new(config: MqttPublisherConfig, register_map: Arc<RegisterMap<String>>) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            config,
            register_map,
            enabled: AtomicBool::new(true),
            connected: Arc::new(connected),
            session: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &MqttPublisherConfig {
        &self.config
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn options(&self) -> Result<MqttOptions, ProtocolError> {
        let endpoint = parse_broker_url(&self.config.broker_url)?;
        let client_id = self
            .config
            .client_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("gw-publisher-{}", uuid::Uuid::new_v4()));

        let mut options = MqttOptions::new(client_id, endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        if let Some(username) = &self.config.username {
            options.set_credentials(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }
        if let Some(topic) = self.config.status_topic() {
            options.set_last_will(LastWill::new(
                topic,
                status_payload(&self.config.device_id, "offline"),
                qos_from_u8(self.config.qos),
                true,
            ));
        }
        if endpoint.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        Ok(options)
    }

    async fn open_session(&self) -> Result<(), ProtocolError> {
        let options = self.options()?;
        let (client, mut eventloop) = AsyncClient::new(options, EVENTLOOP_CAPACITY);
        let cancel = self.shutdown.child_token();
        let connected = Arc::clone(&self.connected);
        let status_client = client.clone();
        let status_topic = self.config.status_topic().map(str::to_string);
        let device_id = self.config.device_id.clone();
        let qos = qos_from_u8(self.config.qos);
        let loop_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            connected.send_replace(true);
                            info!(target: "gw.mqtt", "mqtt_connected");
                            if let Some(topic) = &status_topic {
                                let payload = status_payload(&device_id, "online");
                                if let Err(err) = status_client.try_publish(topic, qos, true, payload)
                                {
                                    warn!(target: "gw.mqtt", error = %err, "mqtt_status_publish_failed");
                                }
                            }
                        } else {
                            connected.send_replace(false);
                            warn!(target: "gw.mqtt", code = ?ack.code, "mqtt_connect_refused");
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        connected.send_replace(false);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if connected.send_replace(false) {
                            warn!(target: "gw.mqtt", error = %err, "mqtt_connection_lost");
                        } else {
                            debug!(target: "gw.mqtt", error = %err, "mqtt_eventloop_error");
                        }
                        tokio::select! {
                            _ = loop_cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
            connected.send_replace(false);
        });

        *self.session.lock().await = Some(MqttSession {
            client,
            task,
            cancel,
        });

        let mut state = self.connected.subscribe();
        let timeout = Duration::from_millis(self.config.connect_timeout_ms.max(1));
        match tokio::time::timeout(timeout, state.wait_for(|connected| *connected)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ProtocolError::ChannelClosed),
            Err(_) => Err(ProtocolError::Timeout(format!(
                "connack from {}",
                self.config.broker_url
            ))),
        }
    }

    /// 关闭会话；`graceful` 时先发布 offline 状态再断开
    async fn close_session(&self, graceful: bool) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        if graceful {
            if let Some(topic) = self.config.status_topic() {
                let payload = status_payload(&self.config.device_id, "offline");
                let _ = session
                    .client
                    .publish(topic, qos_from_u8(self.config.qos), true, payload)
                    .await;
            }
            let _ = session.client.disconnect().await;
        } else {
            session.cancel.cancel();
        }
        let mut task = session.task;
        if tokio::time::timeout(Duration::from_secs(2), &mut task)
            .await
            .is_err()
        {
            session.cancel.cancel();
            let _ = task.await;
        }
        self.connected.send_replace(false);
    }
}

#[async_trait]
impl ProtocolAdapter for MqttAdapter {
    fn key(&self) -> &str {
        MQTT_KEY
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn initialize(&self) -> Result<(), ProtocolError> {
        if let Err(err) = self.open_session().await {
            self.close_session(false).await;
            return Err(err);
        }
        info!(
            target: "gw.mqtt",
            broker = %self.config.broker_url,
            topic = %self.config.data_topic,
            "mqtt_session_opened"
        );
        Ok(())
    }

    async fn send(&self, batch: &[Measurement]) -> Result<usize, ProtocolError> {
        if batch.is_empty() {
            return Ok(0);
        }
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected(self.config.broker_url.clone()));
        }
        let payload = build_payload(&self.config.device_id, &self.register_map, batch);
        let count = payload.data_points.len();
        let bytes = serde_json::to_vec(&payload).map_err(|e| ProtocolError::Mqtt(e.to_string()))?;

        let session = self.session.lock().await;
        let client = &session
            .as_ref()
            .ok_or_else(|| ProtocolError::NotConnected(self.config.broker_url.clone()))?
            .client;
        client
            .publish(
                self.config.data_topic.clone(),
                qos_from_u8(self.config.qos),
                self.config.retain,
                bytes,
            )
            .await
            .map_err(|e| ProtocolError::Mqtt(e.to_string()))?;
        debug!(target: "gw.mqtt", points = count, "mqtt_batch_published");
        Ok(count)
    }

    async fn disconnect(&self) {
        self.close_session(true).await;
        self.shutdown.cancel();
        info!(target: "gw.mqtt", broker = %self.config.broker_url, "mqtt_disconnected");
    }

    async fn reconnect(&self) -> Result<bool, ProtocolError> {
        if self.shutdown.is_cancelled() {
            return Ok(false);
        }
        self.close_session(false).await;
        self.open_session().await?;
        Ok(self.is_connected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Quality, TagValue};

    #[test]
    fn parse_plain_and_tls_urls() {
        assert_eq!(
            parse_broker_url("mqtt://broker.local").unwrap(),
            BrokerEndpoint {
                host: "broker.local".to_string(),
                port: 1883,
                tls: false
            }
        );
        let tls = parse_broker_url("mqtts://broker.local:9883").unwrap();
        assert_eq!(tls.port, 9883);
        assert!(tls.tls);
        assert_eq!(parse_broker_url("mqtts://broker.local").unwrap().port, 8883);
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        assert!(parse_broker_url("http://broker.local").is_err());
        assert!(parse_broker_url("not a url").is_err());
    }

    #[test]
    fn unregistered_tag_is_still_published() {
        let map: RegisterMap<String> = [("T1".to_string(), "C1".to_string())]
            .into_iter()
            .collect();
        let batch = vec![
            Measurement::new("T1", TagValue::F64(1.5), Quality::Good),
            Measurement::new("T9", TagValue::Bool(true), Quality::Uncertain),
        ];
        let payload = build_payload("gw-01", &map, &batch);
        assert_eq!(payload.data_points.len(), 2);
        assert_eq!(payload.data_points[0].code, "C1");
        assert_eq!(payload.data_points[1].code, UNREGISTERED_CODE);
        assert_eq!(payload.data_points[1].quality, "Uncertain");

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["deviceId"], "gw-01");
        assert_eq!(json["dataPoints"][1]["tag"], "T9");
        assert_eq!(json["dataPoints"][1]["value"], true);
    }

    #[test]
    fn qos_out_of_range_falls_back_to_at_least_once() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_u8(9), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn send_without_session_is_not_connected() {
        let config = MqttPublisherConfig::from_json(
            r#"{"brokerUrl": "mqtt://127.0.0.1:1", "dataTopic": "gw/data"}"#,
        )
        .unwrap();
        let adapter = MqttAdapter::new(config, Arc::new(RegisterMap::new()));
        let batch = vec![Measurement::new("T1", TagValue::I64(1), Quality::Good)];
        assert!(matches!(
            adapter.send(&batch).await,
            Err(ProtocolError::NotConnected(_))
        ));
        assert!(!adapter.is_connected());
    }
}
