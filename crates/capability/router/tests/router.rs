use async_trait::async_trait;
use domain::{Measurement, Quality, TagValue};
use domain::RegisterMap;
use gw_protocol::{MsaClient, MsaClientConfig, ProtocolAdapter, ProtocolError};
use gw_router::{DispatchOutcome, ProtocolRouter, RouterError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

struct MockAdapter {
    key: &'static str,
    connected: AtomicBool,
    fail_send: bool,
    fail_init: bool,
    hang_send: bool,
    sends: AtomicUsize,
    disconnects: AtomicUsize,
}

impl MockAdapter {
    fn new(key: &'static str, connected: bool, fail_send: bool) -> Arc<Self> {
        Arc::new(Self {
            key,
            connected: AtomicBool::new(connected),
            fail_send,
            fail_init: false,
            hang_send: false,
            sends: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        })
    }

    fn failing_init(key: &'static str) -> Arc<Self> {
        Arc::new(Self {
            key,
            connected: AtomicBool::new(false),
            fail_send: false,
            fail_init: true,
            hang_send: false,
            sends: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        })
    }

    /// 已连接但 send 永不返回
    fn hanging(key: &'static str) -> Arc<Self> {
        Arc::new(Self {
            key,
            connected: AtomicBool::new(true),
            fail_send: false,
            fail_init: false,
            hang_send: true,
            sends: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ProtocolAdapter for MockAdapter {
    fn key(&self) -> &str {
        self.key
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> Result<(), ProtocolError> {
        if self.fail_init {
            return Err(ProtocolError::Connection("refused".to_string()));
        }
        Ok(())
    }

    async fn send(&self, batch: &[Measurement]) -> Result<usize, ProtocolError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if self.hang_send {
            std::future::pending::<()>().await;
        }
        if self.fail_send {
            return Err(ProtocolError::NotConnected(self.key.to_string()));
        }
        Ok(batch.len())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn reconnect(&self) -> Result<bool, ProtocolError> {
        Ok(self.is_connected())
    }
}

fn batch() -> Vec<Measurement> {
    vec![
        Measurement::new("T1", TagValue::F64(1.0), Quality::Good),
        Measurement::new("T2", TagValue::Bool(false), Quality::Bad),
    ]
}

async fn router_with(adapters: &[Arc<MockAdapter>]) -> ProtocolRouter {
    let router = ProtocolRouter::new();
    let candidates: Vec<Arc<dyn ProtocolAdapter>> = adapters
        .iter()
        .map(|adapter| Arc::clone(adapter) as Arc<dyn ProtocolAdapter>)
        .collect();
    router.initialize_all(candidates).await.expect("initialize");
    router
}

#[tokio::test]
async fn one_of_three_succeeds_is_success() {
    let adapters = [
        MockAdapter::new("a", true, true),
        MockAdapter::new("b", true, false),
        MockAdapter::new("c", true, true),
    ];
    let router = router_with(&adapters).await;

    let report = router.dispatch(&batch()).await;
    assert!(report.is_success());
    assert_eq!(report.outcome, DispatchOutcome::Delivered);
    assert_eq!(report.delivered, vec![("b".to_string(), 2)]);
    assert_eq!(report.failed.len(), 2);
    for adapter in &adapters {
        assert_eq!(adapter.sends.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn all_failing_is_failure() {
    let adapters = [
        MockAdapter::new("a", true, true),
        MockAdapter::new("b", true, true),
        MockAdapter::new("c", true, true),
    ];
    let router = router_with(&adapters).await;

    let report = router.dispatch(&batch()).await;
    assert!(!report.is_success());
    assert_eq!(report.outcome, DispatchOutcome::AllFailed);
    assert_eq!(report.failed.len(), 3);
}

#[tokio::test]
async fn no_connected_adapter_fails_without_sending() {
    let adapters = [
        MockAdapter::new("a", false, false),
        MockAdapter::new("b", false, false),
    ];
    let router = router_with(&adapters).await;

    let report = router.dispatch(&batch()).await;
    assert_eq!(report.outcome, DispatchOutcome::NoConnectedAdapters);
    assert!(!report.is_success());
    for adapter in &adapters {
        assert_eq!(adapter.sends.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn empty_batch_is_noop_success() {
    let adapters = [MockAdapter::new("a", false, true)];
    let router = router_with(&adapters).await;

    let report = router.dispatch(&[]).await;
    assert_eq!(report.outcome, DispatchOutcome::Empty);
    assert!(report.is_success());
    assert_eq!(adapters[0].sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disconnected_adapter_is_skipped() {
    let adapters = [
        MockAdapter::new("up", true, false),
        MockAdapter::new("down", false, false),
    ];
    let router = router_with(&adapters).await;

    assert!(router.dispatch(&batch()).await.is_success());
    assert_eq!(adapters[0].sends.load(Ordering::SeqCst), 1);
    assert_eq!(adapters[1].sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_initialize_is_excluded() {
    let good = MockAdapter::new("good", true, false);
    let bad = MockAdapter::failing_init("bad");
    let router = ProtocolRouter::new();
    let active = router
        .initialize_all(vec![
            good.clone() as Arc<dyn ProtocolAdapter>,
            bad.clone() as Arc<dyn ProtocolAdapter>,
        ])
        .await
        .unwrap();
    assert_eq!(active, 1);

    let keys: Vec<String> = router
        .adapters()
        .await
        .iter()
        .map(|adapter| adapter.key().to_string())
        .collect();
    assert_eq!(keys, vec!["good"]);
}

#[tokio::test]
async fn all_initialize_failures_report_no_adapters() {
    let router = ProtocolRouter::new();
    let result = router
        .initialize_all(vec![MockAdapter::failing_init("x") as Arc<dyn ProtocolAdapter>])
        .await;
    assert!(matches!(result, Err(RouterError::NoAdapters)));
}

#[tokio::test]
async fn stop_all_disconnects_and_clears() {
    let adapters = [
        MockAdapter::new("a", true, false),
        MockAdapter::new("b", true, false),
    ];
    let router = router_with(&adapters).await;

    router.stop_all().await;
    assert!(router.adapters().await.is_empty());
    for adapter in &adapters {
        assert_eq!(adapter.disconnects.load(Ordering::SeqCst), 1);
    }
    let report = router.dispatch(&batch()).await;
    assert_eq!(report.outcome, DispatchOutcome::NoConnectedAdapters);
}

#[tokio::test]
async fn reinitialize_replaces_and_disconnects_previous_adapters() {
    let first = MockAdapter::new("a", true, false);
    let second = MockAdapter::new("b", true, false);
    let router = router_with(&[first.clone()]).await;

    router
        .initialize_all(vec![second.clone() as Arc<dyn ProtocolAdapter>])
        .await
        .unwrap();

    let keys: Vec<String> = router
        .adapters()
        .await
        .iter()
        .map(|adapter| adapter.key().to_string())
        .collect();
    assert_eq!(keys, vec!["b"]);
    assert_eq!(first.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(second.disconnects.load(Ordering::SeqCst), 0);

    router.dispatch(&batch()).await;
    assert_eq!(first.sends.load(Ordering::SeqCst), 0);
    assert_eq!(second.sends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reinitialize_keeps_adapter_present_in_both_sets() {
    let kept = MockAdapter::new("kept", true, false);
    let router = router_with(&[kept.clone()]).await;

    router
        .initialize_all(vec![kept.clone() as Arc<dyn ProtocolAdapter>])
        .await
        .unwrap();

    assert_eq!(router.adapters().await.len(), 1);
    assert_eq!(kept.disconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn hung_adapter_times_out_without_blocking_others() {
    let hung = MockAdapter::hanging("hung");
    let healthy = MockAdapter::new("healthy", true, false);
    let router = ProtocolRouter::with_send_timeout(Duration::from_millis(100));
    router
        .initialize_all(vec![
            hung.clone() as Arc<dyn ProtocolAdapter>,
            healthy.clone() as Arc<dyn ProtocolAdapter>,
        ])
        .await
        .unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), router.dispatch(&batch()))
        .await
        .expect("dispatch must be bounded by the send timeout");
    assert_eq!(report.outcome, DispatchOutcome::Delivered);
    assert_eq!(report.delivered, vec![("healthy".to_string(), 2)]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "hung");
    assert!(report.failed[0].1.contains("timed out"));
}

#[tokio::test]
async fn stalled_msa_peer_does_not_block_dispatch() {
    // 对端接受连接后从不读取，发送缓冲区最终会被写满
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = MsaClientConfig::from_json(&format!(
        r#"{{"host": "127.0.0.1", "port": {}, "heartbeatIntervalMs": 600000, "sendTimeoutMs": 200}}"#,
        port
    ))
    .unwrap();
    let map: RegisterMap<String> = [("T1".to_string(), "C1".to_string())]
        .into_iter()
        .collect();
    let msa = Arc::new(MsaClient::new(config, Arc::new(map)));
    let healthy = MockAdapter::new("healthy", true, false);

    let router = ProtocolRouter::with_send_timeout(Duration::from_secs(2));
    router
        .initialize_all(vec![
            msa.clone() as Arc<dyn ProtocolAdapter>,
            healthy.clone() as Arc<dyn ProtocolAdapter>,
        ])
        .await
        .unwrap();
    let (_peer, _) = listener.accept().await.unwrap();
    assert!(msa.is_connected());

    let payload = "x".repeat(1024 * 1024);
    let big = vec![Measurement::new(
        "T1",
        TagValue::String(payload),
        Quality::Good,
    )];
    let mut dispatches = 0;
    while msa.is_connected() && dispatches < 64 {
        let report = tokio::time::timeout(Duration::from_secs(5), router.dispatch(&big))
            .await
            .expect("dispatch must not hang on a stalled peer");
        assert!(report.is_success());
        dispatches += 1;
    }

    assert!(!msa.is_connected());
    assert_eq!(healthy.sends.load(Ordering::SeqCst), dispatches);
    router.stop_all().await;
}
