//! `gx-node-sdk`: runtime for Galaxy nodes.
//!
//! A "node" is any process that talks to the orchestration server over one
//! WebSocket, registers itself as a device, and exchanges requests, events
//! and streams with the server and with peer nodes. This crate owns the
//! connection and reconnection state machine, request/response
//! correlation and the node registry, so node authors only write handlers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  NodeRuntime                                                 │
//! │                                                              │
//! │   Communicator ──▶ NodeRegistry ── local? ──▶ LocalDispatch  │
//! │        │                                        │            │
//! │        │ remote                                 ▼            │
//! │        ▼                                  MessageRouter      │
//! │   ConnectionManager ◀── dispatcher ◀── inbound frames        │
//! │        │      ▲                                              │
//! │        ▼      │                                              │
//! │    Connector (WebSocket)                                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Connection flow
//!
//! 1. Connect WS to `gateway_url`
//! 2. Send `device_register { device_info { device_id, device_type, name, capabilities } }`
//! 3. Every `heartbeat_interval`: send `heartbeat`
//! 4. Main loop:
//!    - structured / simple `request`: dispatch to the action handler, always answer `response`
//!    - `response`: resolve the pending request by `correlation_id`
//!    - `ping`: answer `pong`
//!    - device `command` / `node_wakeup` / `node_activate`: run locally, answer with `original_message_id`
//! 5. On drop: reconnect after `base_delay * attempt`, up to `max_attempts`
//!
//! ```rust,no_run
//! use gx_node_sdk::{handler_fn, AgentConfig, NodeRuntimeBuilder};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let (config, _path) = AgentConfig::load()?;
//! let runtime = NodeRuntimeBuilder::from_config(&config)
//!     .handler("echo", handler_fn(|_ctx, payload| async move {
//!         Ok(serde_json::Value::Object(payload))
//!     }))
//!     .build()?;
//! runtime.start().await?;
//! tokio::signal::ctrl_c().await?;
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod communicator;
pub mod config;
pub mod connection;
pub mod handler;
pub mod pending;
pub mod reconnect;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod transport;
pub mod types;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use builder::NodeRuntimeBuilder;
pub use communicator::{Communicator, LocalDispatch};
pub use config::{AgentConfig, ConfigIssue, ConfigSeverity};
pub use connection::{ConnectionManager, ConnectionState, Link};
pub use handler::{
    handler_fn, listener_fn, ActionContext, ActionHandler, Event, EventListener, NodeHandler, StreamHandler,
};
pub use pending::{PendingRequests, WaitOutcome};
pub use reconnect::ReconnectPolicy;
pub use registry::{NodeIdentity, NodeKind, NodeRegistry};
pub use router::MessageRouter;
pub use runtime::NodeRuntime;
pub use transport::{Connector, TransportChannels, TransportEvent, WsConnector};
pub use types::{
    BroadcastReport, HandlerError, HandlerResult, RegistryError, RuntimeError, SendOptions, SendResult,
    TransportError,
};

// Re-export protocol types so nodes never need to import gx-protocol directly.
pub use gx_protocol::{
    DeviceMessage, DeviceMessageType, Message, MessageHeader, MessagePriority, MessageType, NodeMessage, Payload,
    Reply, StreamError, StreamMessage, StreamSession,
};
