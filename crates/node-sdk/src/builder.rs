//! Builder pattern for constructing a [`NodeRuntime`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::communicator::{Communicator, LocalDispatch};
use crate::config::AgentConfig;
use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::handler::{ActionContext, ActionHandler, EventListener, NodeHandler, StreamHandler};
use crate::pending::PendingRequests;
use crate::reconnect::ReconnectPolicy;
use crate::registry::{NodeIdentity, NodeKind, NodeRegistry};
use crate::router::{MessageRouter, STREAM_IDLE_TIMEOUT};
use crate::runtime::NodeRuntime;
use crate::transport::{Connector, WsConnector};
use crate::types::{HandlerResult, RuntimeError};
use gx_protocol::{DeviceMessageType, Payload};

/// Buffer between the connection and the dispatcher.
const INBOUND_BUFFER: usize = 256;

/// Fluent builder for [`NodeRuntime`].
///
/// # Example
///
/// ```rust,no_run
/// # use gx_node_sdk::{handler_fn, NodeRuntimeBuilder};
/// # async fn demo() -> Result<(), gx_node_sdk::RuntimeError> {
/// let runtime = NodeRuntimeBuilder::new()
///     .gateway_url("ws://orchestrator:8765/ws/device")
///     .node_id("pixel-7")
///     .name("Pixel 7")
///     .capabilities(vec!["gui_click".to_string()])
///     .handler("echo", handler_fn(|_ctx, payload| async move {
///         Ok(serde_json::Value::Object(payload))
///     }))
///     .build()?;
/// runtime.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct NodeRuntimeBuilder {
    gateway_url: String,
    node_id: String,
    name: String,
    device_type: String,
    capabilities: Vec<String>,
    heartbeat_interval: Duration,
    reconnect: ReconnectPolicy,
    request_timeout: Duration,
    max_concurrent_handlers: usize,
    max_frame_bytes: usize,
    stream_idle_timeout: Duration,
    handlers: Vec<(String, Arc<dyn ActionHandler>)>,
    listeners: Vec<(String, Arc<dyn EventListener>)>,
    stream_handler: Option<Arc<dyn StreamHandler>>,
    peers: Vec<(NodeIdentity, Option<Arc<dyn NodeHandler>>)>,
    connector: Option<Arc<dyn Connector>>,
}

impl NodeRuntimeBuilder {
    pub fn new() -> Self {
        Self::from_config(&AgentConfig::default())
    }

    /// Start from a loaded [`AgentConfig`].
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            gateway_url: config.gateway_url.clone(),
            node_id: config.node_id.clone(),
            name: config.node_name.clone(),
            device_type: config.device_type.clone(),
            capabilities: config.capabilities.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            reconnect: config.reconnect_policy(),
            request_timeout: config.request_timeout(),
            max_concurrent_handlers: config.max_concurrent_handlers,
            max_frame_bytes: config.max_frame_bytes,
            stream_idle_timeout: STREAM_IDLE_TIMEOUT,
            handlers: Vec::new(),
            listeners: Vec::new(),
            stream_handler: None,
            peers: Vec::new(),
            connector: None,
        }
    }

    // ── Identity ─────────────────────────────────────────────────────

    /// Orchestration server endpoint (e.g. `ws://host:8765/ws/device`).
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = url.into();
        self
    }

    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = id.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Reported as `device_type`; also decides this node's [`NodeKind`].
    pub fn device_type(mut self, t: impl Into<String>) -> Self {
        self.device_type = t.into();
        self
    }

    pub fn capabilities(mut self, caps: impl Into<Vec<String>>) -> Self {
        self.capabilities = caps.into();
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = d;
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Default timeout for sends that wait for a response (30s).
    pub fn request_timeout(mut self, d: Duration) -> Self {
        self.request_timeout = d;
        self
    }

    pub fn max_concurrent_handlers(mut self, n: usize) -> Self {
        self.max_concurrent_handlers = n;
        self
    }

    /// Inbound frames larger than this are dropped unparsed (256 KB).
    pub fn max_frame_bytes(mut self, n: usize) -> Self {
        self.max_frame_bytes = n;
        self
    }

    /// Open streams that see no chunk for this long are dropped.
    pub fn stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    /// Replace the WebSocket transport, e.g. with an in-memory one.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    // ── Handlers ─────────────────────────────────────────────────────

    /// Handle requests for `action`. Replaces the built-in `node_wakeup`
    /// handler when `action` is `"node_wakeup"`.
    pub fn handler<H: ActionHandler>(mut self, action: impl Into<String>, handler: H) -> Self {
        self.handlers.push((action.into(), Arc::new(handler)));
        self
    }

    pub fn listener<L: EventListener>(mut self, event_type: impl Into<String>, listener: L) -> Self {
        self.listeners.push((event_type.into(), Arc::new(listener)));
        self
    }

    pub fn stream_handler<S: StreamHandler>(mut self, handler: S) -> Self {
        self.stream_handler = Some(Arc::new(handler));
        self
    }

    /// Register a remote peer known up front.
    pub fn peer(mut self, identity: NodeIdentity) -> Self {
        self.peers.push((identity, None));
        self
    }

    /// Register an in-process peer.
    pub fn local_peer<N: NodeHandler>(mut self, identity: NodeIdentity, handler: N) -> Self {
        self.peers.push((identity, Some(Arc::new(handler))));
        self
    }

    /// Build the [`NodeRuntime`]. Nothing connects until
    /// [`NodeRuntime::start`].
    pub fn build(self) -> Result<NodeRuntime, RuntimeError> {
        if self.gateway_url.trim().is_empty() {
            return Err(RuntimeError::Config("gateway_url is required".into()));
        }
        if self.node_id.trim().is_empty() {
            return Err(RuntimeError::Config("node_id is required".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(RuntimeError::Config("heartbeat_interval must be greater than 0".into()));
        }
        if self.max_concurrent_handlers == 0 {
            return Err(RuntimeError::Config("max_concurrent_handlers must be at least 1".into()));
        }

        let pending = Arc::new(PendingRequests::new());
        let router = Arc::new(
            MessageRouter::new(self.node_id.clone(), pending.clone()).with_stream_idle_timeout(self.stream_idle_timeout),
        );
        router.register(
            DeviceMessageType::NodeWakeup.as_str(),
            WakeupHandler {
                node_id: self.node_id.clone(),
            },
        );
        for (action, handler) in self.handlers {
            router.register_arc(action, handler);
        }
        for (event_type, listener) in self.listeners {
            router.add_listener_arc(event_type, listener);
        }
        if let Some(handler) = self.stream_handler {
            router.set_stream_handler_arc(handler);
        }

        let kind = self.device_type.parse::<NodeKind>().unwrap_or_else(|e| {
            tracing::debug!(error = %e, "treating node as android");
            NodeKind::Android
        });
        let registry = Arc::new(NodeRegistry::new());
        registry.register(
            NodeIdentity::new(self.node_id.clone(), kind, self.name.clone())
                .with_capabilities(self.capabilities.clone()),
            Some(Arc::new(LocalDispatch::new(self.node_id.clone(), router.clone()))),
        );
        for (identity, handler) in self.peers {
            registry.register(identity, handler);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::default()));
        let connection = Arc::new(ConnectionManager::new(
            ConnectionConfig {
                url: self.gateway_url,
                device_id: self.node_id.clone(),
                device_type: self.device_type,
                device_name: self.name,
                capabilities: self.capabilities,
                heartbeat_interval: self.heartbeat_interval,
                reconnect: self.reconnect,
            },
            connector,
            inbound_tx,
        ));

        let communicator = Arc::new(Communicator::new(
            self.node_id.clone(),
            registry.clone(),
            router.clone(),
            connection.clone(),
            self.request_timeout,
        ));

        Ok(NodeRuntime {
            node_id: self.node_id,
            registry,
            router,
            pending,
            connection,
            communicator,
            max_concurrent_handlers: self.max_concurrent_handlers,
            max_frame_bytes: self.max_frame_bytes,
            stream_idle_timeout: self.stream_idle_timeout,
            shutdown: CancellationToken::new(),
            inbound: Mutex::new(Some(inbound_rx)),
            dispatcher: Mutex::new(None),
        })
    }
}

impl Default for NodeRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in `node_wakeup` answer.
struct WakeupHandler {
    node_id: String,
}

#[async_trait::async_trait]
impl ActionHandler for WakeupHandler {
    async fn call(&self, _ctx: ActionContext, _payload: Payload) -> HandlerResult {
        Ok(json!({ "status": "awake", "node_id": self.node_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    #[test]
    fn build_validates_required_fields() {
        let err = NodeRuntimeBuilder::new().gateway_url("").build().err().unwrap();
        assert!(matches!(err, RuntimeError::Config(ref m) if m.contains("gateway_url")));

        let err = NodeRuntimeBuilder::new().node_id(" ").build().err().unwrap();
        assert!(matches!(err, RuntimeError::Config(ref m) if m.contains("node_id")));

        let err = NodeRuntimeBuilder::new()
            .heartbeat_interval(Duration::ZERO)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::Config(_)));
    }

    #[tokio::test]
    async fn build_registers_self_and_peers() {
        let rt = NodeRuntimeBuilder::new()
            .node_id("mac")
            .device_type("desktop")
            .capabilities(vec!["file_read".to_string()])
            .peer(NodeIdentity::new("srv", NodeKind::Server, "Server"))
            .handler("ls", handler_fn(|_c, _p| async { Ok(json!([])) }))
            .build()
            .unwrap();

        let me = rt.registry().get("mac").unwrap();
        assert_eq!(me.kind, NodeKind::Desktop);
        assert_eq!(me.capabilities, vec!["file_read"]);
        assert!(rt.registry().is_local("mac"));
        assert!(!rt.registry().is_local("srv"));
        assert_eq!(rt.router().actions(), vec!["ls", "node_wakeup"]);
    }

    #[test]
    fn unknown_device_type_falls_back_to_android() {
        let rt = NodeRuntimeBuilder::new().device_type("toaster").build().unwrap();
        assert_eq!(rt.registry().get("android-node").unwrap().kind, NodeKind::Android);
    }

    #[test]
    fn from_config_carries_limits() {
        let config = AgentConfig {
            node_id: "tablet".into(),
            max_concurrent_handlers: 4,
            max_frame_bytes: 1024,
            ..Default::default()
        };
        let rt = NodeRuntimeBuilder::from_config(&config).build().unwrap();
        assert_eq!(rt.node_id(), "tablet");
        assert_eq!(rt.max_concurrent_handlers, 4);
        assert_eq!(rt.max_frame_bytes, 1024);
        assert_eq!(rt.communicator().default_timeout(), Duration::from_secs(30));
    }
}
