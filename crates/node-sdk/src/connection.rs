//! Connection manager: owns the transport to the orchestration server and
//! drives the connect / heartbeat / reconnect state machine.
//!
//! ```text
//!  Disconnected ──connect()──▶ Connecting ──open──▶ Connected
//!       ▲                        ▲     │              │
//!       │ disconnect()           │     │ fail         │ drop
//!       │                        │     ▼              ▼
//!       └──────────────────── Reconnecting ◀──────────┘
//!                                │ attempts exhausted
//!                                ▼
//!                              Error
//! ```
//!
//! One supervisor task runs per connect cycle. It owns the reconnect delay
//! and spawns a heartbeat task for each connected session, which is aborted
//! as soon as the session ends.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gx_protocol::{DeviceMessage, DeviceMessageType};
use parking_lot::Mutex;
use serde::de::IgnoredAny;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::reconnect::ReconnectPolicy;
use crate::transport::{Connector, TransportChannels, TransportEvent};
use crate::types::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Outbound side of the live connection as seen by the communicator.
#[async_trait::async_trait]
pub trait Link: Send + Sync + 'static {
    async fn send_frame(&self, text: String) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub device_id: String,
    pub device_type: String,
    pub device_name: String,
    pub capabilities: Vec<String>,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    /// Cancellation token of the cycle in flight. State transitions made by
    /// a cycle happen under this lock so a concurrent `disconnect()` wins.
    cycle: Mutex<Option<CancellationToken>>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    /// Frames for the runtime dispatcher.
    inbound: mpsc::Sender<String>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        inbound: mpsc::Sender<String>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            connector,
            state,
            attempts: AtomicU32::new(0),
            cycle: Mutex::new(None),
            outbound: Mutex::new(None),
            inbound,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Reconnect attempts made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Start a connect cycle and wait for the first attempt to open or
    /// fail. A failed first attempt still leaves the cycle reconnecting in
    /// the background.
    ///
    /// No-op while a cycle is already connecting, connected or
    /// reconnecting.
    pub async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        let (first_tx, first_rx) = oneshot::channel();
        {
            let mut cycle = self.cycle.lock();
            let state = self.state();
            if matches!(
                state,
                ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
            ) {
                tracing::debug!(state = %state, "connect() ignored, cycle already in flight");
                return Ok(());
            }
            let token = CancellationToken::new();
            *cycle = Some(token.clone());
            self.attempts.store(0, Ordering::SeqCst);
            self.state.send_replace(ConnectionState::Connecting);
            tokio::spawn(Arc::clone(self).supervise(token, first_tx));
        }

        first_rx.await.unwrap_or(Err(TransportError::Cancelled))
    }

    /// Stop the cycle: cancel the heartbeat and any scheduled reconnect,
    /// close the transport, and go `Disconnected`. No reconnection follows.
    pub fn disconnect(&self) {
        {
            let mut cycle = self.cycle.lock();
            if let Some(token) = cycle.take() {
                token.cancel();
            }
            self.state.send_replace(ConnectionState::Disconnected);
        }
        *self.outbound.lock() = None;
        tracing::info!(node_id = %self.config.device_id, "disconnected");
    }

    /// Set `next` unless `cancel` has fired. Returns whether it was applied.
    fn transition(&self, cancel: &CancellationToken, next: ConnectionState) -> bool {
        let mut cycle = self.cycle.lock();
        if cancel.is_cancelled() {
            return false;
        }
        if next == ConnectionState::Error {
            *cycle = None;
        }
        self.state.send_replace(next);
        true
    }

    async fn supervise(
        self: Arc<Self>,
        cancel: CancellationToken,
        first: oneshot::Sender<Result<(), TransportError>>,
    ) {
        let mut first = Some(first);
        let mut first_error = None;
        let node_id = self.config.device_id.clone();

        loop {
            if !self.transition(&cancel, ConnectionState::Connecting) {
                break;
            }
            tracing::info!(url = %self.config.url, node_id = %node_id, "connecting");

            let attempt = tokio::select! {
                r = self.connector.connect(&self.config.url) => r,
                _ = cancel.cancelled() => break,
            };

            match attempt {
                Ok(channels) => {
                    if !self.transition(&cancel, ConnectionState::Connected) {
                        break;
                    }
                    self.attempts.store(0, Ordering::SeqCst);
                    tracing::info!(node_id = %node_id, "connected");
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(()));
                    }

                    let reason = self.run_session(channels, &cancel).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    tracing::warn!(node_id = %node_id, reason = %reason, "connection lost");
                }
                Err(e) => {
                    tracing::warn!(
                        node_id = %node_id,
                        attempt = self.reconnect_attempts(),
                        error = %e,
                        "connect failed"
                    );
                    if first.is_some() {
                        first_error = Some(e);
                    }
                }
            }

            let attempts = self.reconnect_attempts();
            if self.config.reconnect.should_give_up(attempts) {
                tracing::error!(
                    node_id = %node_id,
                    attempts,
                    "max reconnect attempts exhausted"
                );
                self.transition(&cancel, ConnectionState::Error);
                if let (Some(tx), Some(e)) = (first.take(), first_error.take()) {
                    let _ = tx.send(Err(e));
                }
                return;
            }

            let attempt = attempts + 1;
            self.attempts.store(attempt, Ordering::SeqCst);
            let delay = self.config.reconnect.delay_for_attempt(attempt);
            if !self.transition(&cancel, ConnectionState::Reconnecting) {
                break;
            }
            // The caller of connect() sees the first failure once the
            // retry is already scheduled.
            if let (Some(tx), Some(e)) = (first.take(), first_error.take()) {
                let _ = tx.send(Err(e));
            }
            tracing::info!(
                node_id = %node_id,
                delay_ms = delay.as_millis() as u64,
                attempt,
                "reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => break,
            }
        }

        if let Some(tx) = first.take() {
            let _ = tx.send(Err(TransportError::Cancelled));
        }
        tracing::debug!(node_id = %node_id, "connect cycle finished");
    }

    /// Pump one connected session until it drops or the cycle is
    /// cancelled. Returns a description of why it ended.
    async fn run_session(&self, channels: TransportChannels, cancel: &CancellationToken) -> String {
        let TransportChannels {
            outbound,
            mut inbound,
        } = channels;
        *self.outbound.lock() = Some(outbound.clone());

        let registration = DeviceMessage::register(
            self.config.device_id.clone(),
            self.config.device_type.clone(),
            &self.config.device_name,
            &self.config.capabilities,
        );
        match registration.to_json_string() {
            Ok(text) => {
                if outbound.send(text).await.is_err() {
                    tracing::warn!("transport closed before registration was sent");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode registration"),
        }

        let heartbeat = spawn_heartbeat(
            outbound.clone(),
            self.config.device_id.clone(),
            self.config.heartbeat_interval,
        );

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break "disconnect requested".to_string(),
                event = inbound.recv() => match event {
                    Some(TransportEvent::Frame(text)) => self.on_frame(text).await,
                    Some(TransportEvent::Closed(reason)) => {
                        break format!("closed by peer: {}", reason.unwrap_or_default());
                    }
                    Some(TransportEvent::Failed(e)) => break format!("transport failure: {e}"),
                    None => break "transport ended".to_string(),
                }
            }
        };

        heartbeat.abort();
        // A newer session may already own the slot.
        let mut slot = self.outbound.lock();
        if slot.as_ref().is_some_and(|tx| tx.same_channel(&outbound)) {
            *slot = None;
        }
        drop(slot);
        reason
    }

    /// Consume acks; forward everything else to the dispatcher.
    async fn on_frame(&self, text: String) {
        #[derive(Deserialize)]
        struct Peek {
            #[serde(rename = "type")]
            kind: Option<String>,
            device_id: Option<IgnoredAny>,
        }

        if let Ok(Peek {
            kind: Some(kind),
            device_id: Some(_),
        }) = serde_json::from_str::<Peek>(&text)
        {
            if kind == DeviceMessageType::HeartbeatAck.as_str() {
                tracing::trace!("heartbeat acknowledged");
                return;
            }
            if kind == DeviceMessageType::DeviceRegisterAck.as_str() {
                tracing::info!(node_id = %self.config.device_id, "registration acknowledged");
                return;
            }
        }

        if self.inbound.send(text).await.is_err() {
            tracing::debug!("dispatcher gone, dropping inbound frame");
        }
    }
}

fn spawn_heartbeat(
    outbound: mpsc::Sender<String>,
    device_id: String,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let text = match DeviceMessage::heartbeat(device_id.clone()).to_json_string() {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode heartbeat");
                    continue;
                }
            };
            if outbound.send(text).await.is_err() {
                break;
            }
            tracing::trace!(node_id = %device_id, "heartbeat sent");
        }
    })
}

#[async_trait::async_trait]
impl Link for ConnectionManager {
    async fn send_frame(&self, text: String) -> Result<(), TransportError> {
        let tx = self.outbound.lock().clone();
        let Some(tx) = tx else {
            return Err(TransportError::NotConnected);
        };
        tx.send(text).await.map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    /// Scripted transport. Each `connect` pops the next outcome; when the
    /// script runs out every attempt fails.
    pub(crate) struct MockConnector {
        script: Mutex<VecDeque<bool>>,
        pub(crate) calls: Mutex<Vec<Instant>>,
        peers: mpsc::UnboundedSender<MockPeer>,
    }

    pub(crate) struct MockPeer {
        /// Frames written by the node.
        pub(crate) from_node: mpsc::Receiver<String>,
        /// Events delivered to the node.
        pub(crate) to_node: mpsc::Sender<TransportEvent>,
    }

    impl MockPeer {
        pub(crate) async fn next_frame(&mut self) -> serde_json::Value {
            let text = self.from_node.recv().await.expect("node closed the transport");
            serde_json::from_str(&text).expect("node sent invalid JSON")
        }
    }

    impl MockConnector {
        pub(crate) fn new(script: &[bool]) -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
            let (peers, rx) = mpsc::unbounded_channel();
            let c = Self {
                script: Mutex::new(script.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
                peers,
            };
            (Arc::new(c), rx)
        }
    }

    #[async_trait::async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _url: &str) -> Result<TransportChannels, TransportError> {
            self.calls.lock().push(Instant::now());
            let open = self.script.lock().pop_front().unwrap_or(false);
            if !open {
                return Err(TransportError::Connect("connection refused".into()));
            }
            let (outbound, from_node) = mpsc::channel(64);
            let (to_node, inbound) = mpsc::channel(64);
            let _ = self.peers.send(MockPeer { from_node, to_node });
            Ok(TransportChannels { outbound, inbound })
        }
    }

    pub(crate) fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            url: "ws://mock/ws/device".into(),
            device_id: "phone-1".into(),
            device_type: "android".into(),
            device_name: "Test Phone".into(),
            capabilities: vec!["gui_click".into()],
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }

    fn manager(
        script: &[bool],
    ) -> (
        Arc<ConnectionManager>,
        Arc<MockConnector>,
        mpsc::UnboundedReceiver<MockPeer>,
        mpsc::Receiver<String>,
    ) {
        let (connector, peers) = MockConnector::new(script);
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let mgr = Arc::new(ConnectionManager::new(test_config(), connector.clone(), inbound_tx));
        (mgr, connector, peers, inbound_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn open_sends_registration_then_heartbeats() {
        let (mgr, _connector, mut peers, _inbound) = manager(&[true]);
        mgr.connect().await.unwrap();
        assert_eq!(mgr.state(), ConnectionState::Connected);

        let mut peer = peers.recv().await.unwrap();
        let reg = peer.next_frame().await;
        assert_eq!(reg["type"], "device_register");
        assert_eq!(reg["device_id"], "phone-1");
        assert_eq!(reg["device_type"], "android");
        assert_eq!(reg["payload"]["device_info"]["capabilities"][0], "gui_click");

        let t0 = Instant::now();
        let hb = peer.next_frame().await;
        assert_eq!(hb["type"], "heartbeat");
        assert!(t0.elapsed() >= Duration::from_secs(30));

        let hb2 = peer.next_frame().await;
        assert_eq!(hb2["type"], "heartbeat");
        assert!(t0.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn drop_reconnects_with_linear_backoff_until_error() {
        let (mgr, connector, mut peers, _inbound) = manager(&[true]);
        mgr.connect().await.unwrap();
        let peer = peers.recv().await.unwrap();

        peer.to_node.send(TransportEvent::Closed(None)).await.unwrap();

        let mut states = mgr.subscribe_state();
        states
            .wait_for(|s| *s == ConnectionState::Error)
            .await
            .unwrap();

        let calls = connector.calls.lock().clone();
        // Initial open plus ten reconnect attempts.
        assert_eq!(calls.len(), 11);
        for k in 1..calls.len() {
            let gap = calls[k] - calls[k - 1];
            let expected = Duration::from_secs(5 * k as u64);
            assert!(
                gap >= expected && gap < expected + Duration::from_millis(50),
                "attempt {k}: gap {gap:?}, expected {expected:?}"
            );
        }
        assert_eq!(mgr.reconnect_attempts(), 10);

        // Nothing further is scheduled.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.calls.lock().len(), 11);
        assert_eq!(mgr.state(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconnect_resets_attempts() {
        let (mgr, connector, mut peers, _inbound) = manager(&[true, false, true]);
        mgr.connect().await.unwrap();
        let first = peers.recv().await.unwrap();
        first.to_node.send(TransportEvent::Failed("reset".into())).await.unwrap();

        let mut second = peers.recv().await.unwrap();
        assert_eq!(second.next_frame().await["type"], "device_register");
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(mgr.reconnect_attempts(), 0);

        let calls = connector.calls.lock().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls[1] - calls[0] >= Duration::from_secs(5));
        assert!(calls[2] - calls[1] >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_disconnect_never_reconnects() {
        let (mgr, connector, mut peers, _inbound) = manager(&[true]);
        mgr.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let _registration = peer.next_frame().await;

        mgr.disconnect();
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        // The transport is closed: every sender is dropped.
        assert!(peer.from_node.recv().await.is_none());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.calls.lock().len(), 1);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(mgr.send_frame("{}".into()).await, Err(TransportError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_scheduled_reconnect() {
        let (mgr, connector, _peers, _inbound) = manager(&[]);
        assert!(mgr.connect().await.is_err());
        assert_eq!(mgr.state(), ConnectionState::Reconnecting);

        mgr.disconnect();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.calls.lock().len(), 1);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_connected_is_noop() {
        let (mgr, connector, _peers, _inbound) = manager(&[true, true]);
        mgr.connect().await.unwrap();
        mgr.connect().await.unwrap();
        assert_eq!(connector.calls.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_after_error_starts_a_new_cycle() {
        let (connector, _peers) = MockConnector::new(&[]);
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let mut config = test_config();
        config.reconnect.max_attempts = 1;
        let mgr = Arc::new(ConnectionManager::new(config, connector.clone(), inbound_tx));

        assert!(mgr.connect().await.is_err());
        mgr.subscribe_state()
            .wait_for(|s| *s == ConnectionState::Error)
            .await
            .unwrap();
        assert_eq!(connector.calls.lock().len(), 2);

        assert!(mgr.connect().await.is_err());
        assert_eq!(connector.calls.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn acks_are_consumed_and_other_frames_forwarded() {
        let (mgr, _connector, mut peers, mut inbound) = manager(&[true]);
        mgr.connect().await.unwrap();
        let peer = peers.recv().await.unwrap();

        let ack = DeviceMessage::new(DeviceMessageType::HeartbeatAck, "server");
        let reg_ack = DeviceMessage::new(DeviceMessageType::DeviceRegisterAck, "server");
        let command = DeviceMessage::new(DeviceMessageType::Command, "server");
        for m in [ack, reg_ack, command.clone()] {
            peer.to_node
                .send(TransportEvent::Frame(m.to_json_string().unwrap()))
                .await
                .unwrap();
        }

        let forwarded = inbound.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&forwarded).unwrap();
        assert_eq!(v["type"], "command");
        assert_eq!(v["message_id"], command.message_id.as_str());
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn send_frame_reaches_peer() {
        let (mgr, _connector, mut peers, _inbound) = manager(&[true]);
        mgr.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let _registration = peer.next_frame().await;

        mgr.send_frame(r#"{"hello":1}"#.into()).await.unwrap();
        assert_eq!(peer.next_frame().await["hello"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_exit_of_old_session_keeps_the_new_link() {
        let (mgr, _connector, mut peers, mut inbound) = manager(&[true, true]);
        mgr.connect().await.unwrap();
        let mut old = peers.recv().await.unwrap();
        let _registration = old.next_frame().await;

        // Nobody drains the dispatcher queue, so the old session stalls
        // forwarding a frame and cannot see the cancellation yet.
        for n in 0..20 {
            let frame = serde_json::json!({"type": "event_broadcast", "n": n}).to_string();
            old.to_node.send(TransportEvent::Frame(frame)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        mgr.disconnect();
        mgr.connect().await.unwrap();
        let mut new = peers.recv().await.unwrap();
        let _registration = new.next_frame().await;

        tokio::spawn(async move { while inbound.recv().await.is_some() {} });
        while old.from_node.recv().await.is_some() {}

        assert_eq!(mgr.state(), ConnectionState::Connected);
        mgr.send_frame(r#"{"after":"restart"}"#.into()).await.unwrap();
        loop {
            let frame = new.next_frame().await;
            if frame["after"] == "restart" {
                break;
            }
            assert_eq!(frame["type"], "heartbeat");
        }
    }
}
