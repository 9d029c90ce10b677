use crate::scheduler::ReconnectGate;
use crate::{MonitorError, MonitorTarget};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 退避与防抖参数
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// 两次重连尝试之间的最短间隔
    pub debounce: Duration,
    /// 重连报告成功后等待状态传播再复查的时间
    pub settle: Duration,
    /// 单次重连操作的超时
    pub reconnect_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 2000,
            max_backoff_ms: 15_000,
            debounce: Duration::from_secs(2),
            settle: Duration::from_millis(100),
            reconnect_timeout: Duration::from_secs(10),
        }
    }
}

/// 监控状态，只由所属监控的 tick 修改
#[derive(Debug, Clone)]
pub struct ConnectionMonitorState {
    pub name: String,
    pub connected: bool,
    pub last_ok: Option<Instant>,
    pub backoff_ms: u64,
    pub reconnect_attempts: u64,
    pub is_reconnecting: bool,
    pub last_reconnect_attempt: Option<Instant>,
    /// 退避到期时间，之前不会发起新的重连
    pub next_eligible_at: Option<Instant>,
}

/// 单次 tick 的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Healthy,
    Paused,
    InFlight,
    Debounced,
    BackingOff,
    Attempted,
}

pub struct ConnectionMonitor {
    target: Arc<dyn MonitorTarget>,
    settings: MonitorSettings,
    state: ConnectionMonitorState,
    inflight: Option<JoinHandle<Result<bool, MonitorError>>>,
    snapshot: watch::Sender<ConnectionMonitorState>,
}

impl ConnectionMonitor {
    pub fn new(name: impl Into<String>, target: Arc<dyn MonitorTarget>) -> Self {
        Self::with_settings(name, target, MonitorSettings::default())
    }

    pub fn with_settings(
        name: impl Into<String>,
        target: Arc<dyn MonitorTarget>,
        settings: MonitorSettings,
    ) -> Self {
        let state = ConnectionMonitorState {
            name: name.into(),
            connected: false,
            last_ok: None,
            backoff_ms: settings.initial_backoff_ms,
            reconnect_attempts: 0,
            is_reconnecting: false,
            last_reconnect_attempt: None,
            next_eligible_at: None,
        };
        let (snapshot, _) = watch::channel(state.clone());
        Self {
            target,
            settings,
            state,
            inflight: None,
            snapshot,
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn state(&self) -> &ConnectionMonitorState {
        &self.state
    }

    /// 订阅状态快照（每次 tick 后更新）
    pub fn subscribe(&self) -> watch::Receiver<ConnectionMonitorState> {
        self.snapshot.subscribe()
    }

    pub async fn tick(&mut self, gate: &ReconnectGate) -> TickOutcome {
        let now = Instant::now();
        if let Some(handle) = self.inflight.take_if(|handle| handle.is_finished()) {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => Err(MonitorError::Reconnect(err.to_string())),
            };
            self.finish_attempt(result, now);
        }

        let outcome = self.evaluate(gate, now);
        self.snapshot.send_replace(self.state.clone());
        outcome
    }

    /// 放弃进行中的重连（停机时调用）
    pub fn abort(&mut self) {
        if let Some(handle) = self.inflight.take() {
            handle.abort();
        }
        self.state.is_reconnecting = false;
    }

    fn evaluate(&mut self, gate: &ReconnectGate, now: Instant) -> TickOutcome {
        if self.target.is_connected() {
            if !self.state.connected {
                info!(target: "gw.monitor", name = %self.state.name, "connection_up");
            }
            self.state.connected = true;
            self.state.last_ok = Some(now);
            self.state.backoff_ms = self.settings.initial_backoff_ms;
            self.state.is_reconnecting = false;
            self.state.next_eligible_at = None;
            return TickOutcome::Healthy;
        }

        if self.state.connected {
            warn!(target: "gw.monitor", name = %self.state.name, "connection_down");
            self.state.connected = false;
        }
        if gate.is_paused() {
            return TickOutcome::Paused;
        }
        if self.inflight.is_some() || self.state.is_reconnecting {
            return TickOutcome::InFlight;
        }
        if let Some(last) = self.state.last_reconnect_attempt {
            if now.duration_since(last) < self.settings.debounce {
                return TickOutcome::Debounced;
            }
        }
        if let Some(eligible_at) = self.state.next_eligible_at {
            if now < eligible_at {
                return TickOutcome::BackingOff;
            }
        }

        self.start_attempt(now);
        TickOutcome::Attempted
    }

    fn start_attempt(&mut self, now: Instant) {
        self.state.is_reconnecting = true;
        self.state.last_reconnect_attempt = Some(now);
        self.state.reconnect_attempts += 1;
        info!(
            target: "gw.monitor",
            name = %self.state.name,
            attempt = self.state.reconnect_attempts,
            backoff_ms = self.state.backoff_ms,
            "reconnect_attempt"
        );

        let target = Arc::clone(&self.target);
        let settle = self.settings.settle;
        let timeout = self.settings.reconnect_timeout;
        self.inflight = Some(tokio::spawn(async move {
            match tokio::time::timeout(timeout, target.reconnect()).await {
                Ok(Ok(true)) => {
                    tokio::time::sleep(settle).await;
                    Ok(target.is_connected())
                }
                Ok(Ok(false)) => Ok(false),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(MonitorError::Timeout(timeout.as_millis() as u64)),
            }
        }));
    }

    fn finish_attempt(&mut self, result: Result<bool, MonitorError>, now: Instant) {
        self.state.is_reconnecting = false;
        match result {
            Ok(true) => {
                info!(target: "gw.monitor", name = %self.state.name, "reconnect_succeeded");
                self.state.backoff_ms = self.settings.initial_backoff_ms;
                self.state.next_eligible_at = None;
            }
            Ok(false) => {
                // 报告成功但复查仍未连接，同样退避后重试
                warn!(target: "gw.monitor", name = %self.state.name, "reconnect_not_effective");
                self.back_off(now);
            }
            Err(err) => {
                warn!(target: "gw.monitor", name = %self.state.name, error = %err, "reconnect_failed");
                self.back_off(now);
            }
        }
    }

    fn back_off(&mut self, now: Instant) {
        self.state.backoff_ms = self
            .state
            .backoff_ms
            .saturating_mul(2)
            .min(self.settings.max_backoff_ms);
        self.state.next_eligible_at = Some(now + Duration::from_millis(self.state.backoff_ms));
        debug!(
            target: "gw.monitor",
            name = %self.state.name,
            backoff_ms = self.state.backoff_ms,
            "reconnect_backoff"
        );
    }
}
