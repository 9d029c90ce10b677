use domain::{Measurement, Quality, RegisterMap, TagValue};
use gw_protocol::codec::{self, HEADER_LEN};
use gw_protocol::{
    Frame, FrameBody, FrameHeader, MsaClient, MsaClientConfig, ProtocolAdapter, TemplateData,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn client_for(port: u16, heartbeat_ms: u64) -> MsaClient {
    let config = MsaClientConfig::from_json(&format!(
        r#"{{"host": "127.0.0.1", "port": {}, "heartbeatIntervalMs": {}, "connectTimeoutMs": 1000,
            "gatewayId": "gw-1", "channelId": "ch-1", "templateId": "tpl-1"}}"#,
        port, heartbeat_ms
    ))
    .expect("config");
    let map: RegisterMap<String> = [("T1".to_string(), "C1".to_string())]
        .into_iter()
        .collect();
    MsaClient::new(config, Arc::new(map))
}

async fn read_frame(stream: &mut TcpStream) -> Frame {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.expect("header");
    let parsed = FrameHeader::parse(&header).expect("parse header");
    let mut buf = header.to_vec();
    buf.resize(HEADER_LEN + parsed.length as usize, 0);
    stream.read_exact(&mut buf[HEADER_LEN..]).await.expect("body");
    codec::decode(&buf).expect("decode")
}

async fn next_template(stream: &mut TcpStream) -> (u32, TemplateData) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = read_frame(stream).await;
            if let FrameBody::TemplateData(data) = frame.body {
                return (frame.uid, data);
            }
        }
    })
    .await
    .expect("template frame")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition");
}

fn scenario_batch() -> Vec<Measurement> {
    vec![
        Measurement::new("T1", TagValue::F64(42.0), Quality::Good),
        Measurement::new("T2", TagValue::String("x".to_string()), Quality::Good),
    ]
}

#[tokio::test]
async fn send_emits_template_with_mapped_points_only() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = client_for(listener.local_addr().unwrap().port(), 200);
    client.initialize().await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();
    assert!(client.is_connected());

    let sent = client.send(&scenario_batch()).await.unwrap();
    assert_eq!(sent, 1);

    let (_, data) = next_template(&mut peer).await;
    assert_eq!(data.points.len(), 1);
    assert_eq!(data.points.get("C1"), Some(&serde_json::json!(42.0)));
    assert_eq!(data.gid, "gw-1");
    assert_eq!(data.cid, "ch-1");
    assert_eq!(data.ptid, "tpl-1");
    assert_eq!(data.level, 103);
    assert_eq!(data.err, 0);

    client.disconnect().await;
}

#[tokio::test]
async fn first_frame_is_ping_with_type_n() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = client_for(listener.local_addr().unwrap().port(), 200);
    client.initialize().await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    let frame = read_frame(&mut peer).await;
    assert_eq!(frame.body, FrameBody::Ping);
    assert_eq!(frame.frame_type, u32::from(b'N'));
    assert_eq!(frame.uid, 0);

    client.disconnect().await;
}

#[tokio::test]
async fn pong_uid_is_echoed_on_later_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = client_for(listener.local_addr().unwrap().port(), 200);
    client.initialize().await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    let pong = codec::encode(&Frame::new(77, 1, FrameBody::Pong { msg: None })).unwrap();
    peer.write_all(&pong).await.unwrap();
    wait_until(|| client.session_uid() == 77).await;

    client.send(&scenario_batch()).await.unwrap();
    let (uid, _) = next_template(&mut peer).await;
    assert_eq!(uid, 77);

    client.disconnect().await;
}

#[tokio::test]
async fn device_not_registered_keeps_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = client_for(listener.local_addr().unwrap().port(), 200);
    client.initialize().await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    let frame = Frame::new(
        0,
        1,
        FrameBody::DeviceNotRegistered {
            msg: Some("unknown gateway".to_string()),
        },
    );
    peer.write_all(&codec::encode(&frame).unwrap()).await.unwrap();
    // 报文体不是 JSON 的帧被丢弃，会话继续
    let mut garbage = Vec::new();
    garbage.extend_from_slice(&u32::from(b'N').to_be_bytes());
    garbage.extend_from_slice(&0u32.to_be_bytes());
    garbage.extend_from_slice(&3u32.to_be_bytes());
    garbage.extend_from_slice(&9u32.to_be_bytes());
    garbage.extend_from_slice(b"{{{");
    peer.write_all(&garbage).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(client.is_connected());
    assert_eq!(client.send(&scenario_batch()).await.unwrap(), 1);
    next_template(&mut peer).await;

    client.disconnect().await;
}

#[tokio::test]
async fn peer_close_marks_disconnected_and_send_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = client_for(listener.local_addr().unwrap().port(), 200);
    client.initialize().await.unwrap();
    let (peer, _) = listener.accept().await.unwrap();
    drop(peer);
    wait_until(|| !client.is_connected()).await;

    let accept = tokio::spawn(async move { listener.accept().await.map(|(stream, _)| stream) });
    assert_eq!(client.send(&scenario_batch()).await.unwrap(), 1);
    let mut peer = accept.await.unwrap().unwrap();
    let (uid, data) = next_template(&mut peer).await;
    assert_eq!(uid, 0);
    assert_eq!(data.points.get("C1"), Some(&serde_json::json!(42.0)));

    client.disconnect().await;
}

#[tokio::test]
async fn unmapped_batch_sends_nothing() {
    let client = client_for(1, 200);
    let batch = vec![Measurement::new("T2", TagValue::I64(1), Quality::Good)];
    assert_eq!(client.send(&batch).await.unwrap(), 0);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn initial_connect_retries_until_listener_appears() {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let client = client_for(port, 50);
    client.initialize().await.unwrap();
    assert!(!client.is_connected());

    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let (_peer, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("retry connect")
        .unwrap();
    wait_until(|| client.is_connected()).await;

    client.disconnect().await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn reconnect_after_disconnect_is_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = client_for(listener.local_addr().unwrap().port(), 200);
    client.initialize().await.unwrap();
    let _peer = listener.accept().await.unwrap();
    client.disconnect().await;
    assert!(!client.reconnect().await.unwrap());
}
