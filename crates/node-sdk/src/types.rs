//! Core types shared across the SDK: handler results, send outcomes and
//! the error enums for each layer.

use std::time::Duration;

use gx_protocol::{Reply, DEFAULT_NODE_PRIORITY};
use serde::Serialize;

/// Result type for action handlers.
pub type HandlerResult = Result<serde_json::Value, HandlerError>;

/// Errors an action handler can return.
///
/// The router turns these into a response with `success: false` and the
/// display string in `error`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("invalid_args: {0}")]
    InvalidArgs(String),
    #[error("not_allowed: {0}")]
    NotAllowed(String),
    #[error("failed: {0}")]
    Failed(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("not_found: {0}")]
    NotFound(String),
}

/// Connection open / write failures. Drives reconnection; callers of the
/// communicator only ever see it folded into [`SendResult::Undelivered`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("connect: {0}")]
    Connect(String),
    #[error("connection closed")]
    Closed,
    #[error("send: {0}")]
    Send(String),
    #[error("cancelled")]
    Cancelled,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node not found: {0}")]
    NotFound(String),
}

/// Top-level runtime error.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("config: {0}")]
    Config(String),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("runtime already started")]
    AlreadyStarted,
    #[error("shutdown")]
    Shutdown,
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

// ── Send options / outcomes ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    pub wait_response: bool,
    /// `None` uses the runtime's default request timeout.
    pub timeout: Option<Duration>,
    /// Advisory, 1..=10.
    pub priority: u8,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            wait_response: false,
            timeout: None,
            priority: DEFAULT_NODE_PRIORITY,
        }
    }
}

impl SendOptions {
    /// Fire-and-forget.
    pub fn fire_and_forget() -> Self {
        Self::default()
    }

    /// Wait for a correlated response.
    pub fn wait() -> Self {
        Self {
            wait_response: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Per-node delivery accounting for a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub success: Vec<String>,
    pub failed: Vec<String>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.success.len() + self.failed.len()
    }
}

/// Outcome of a send. Transport failures and timeouts are values here,
/// never errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SendResult {
    /// A response, delivered locally or correlated from the remote side.
    Replied(Reply),
    /// Fire-and-forget frame handed to the transport.
    Delivered { message_id: String },
    Broadcast(BroadcastReport),
    /// No response arrived in time. Distinct from a `success: false` reply.
    TimedOut { message_id: String, timeout: Duration },
    /// The transport was unavailable or the frame could not be written.
    Undelivered { message_id: String, reason: String },
}

impl SendResult {
    /// Delivered, broadcast, or replied with `success: true`.
    pub fn is_success(&self) -> bool {
        match self {
            SendResult::Replied(r) => r.success,
            SendResult::Delivered { .. } | SendResult::Broadcast(_) => true,
            SendResult::TimedOut { .. } | SendResult::Undelivered { .. } => false,
        }
    }

    pub fn reply(&self) -> Option<&Reply> {
        match self {
            SendResult::Replied(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SendResult::TimedOut { .. })
    }
}
