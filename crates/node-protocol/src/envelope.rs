//! Node protocol envelope: header, message, and the reply shape carried by
//! `response` messages.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Opaque key/value body used for payloads and metadata.
pub type Payload = Map<String, Value>;

/// Target id addressing every registered node.
pub const BROADCAST_TARGET: &str = "*";

/// Target id addressing the originating node.
pub const SELF_TARGET: &str = "self";

/// Default time-to-live for a message, in seconds.
pub const DEFAULT_TTL_SECS: u32 = 30;

// ── Message type / priority ──────────────────────────────────────────

/// Protocol-level message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Broadcast,
    StreamStart,
    StreamData,
    StreamEnd,
    Ping,
    Pong,
    Subscribe,
    Unsubscribe,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 12] = [
        MessageType::Request,
        MessageType::Response,
        MessageType::Event,
        MessageType::Broadcast,
        MessageType::StreamStart,
        MessageType::StreamData,
        MessageType::StreamEnd,
        MessageType::Ping,
        MessageType::Pong,
        MessageType::Subscribe,
        MessageType::Unsubscribe,
        MessageType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Event => "event",
            Self::Broadcast => "broadcast",
            Self::StreamStart => "stream_start",
            Self::StreamData => "stream_data",
            Self::StreamEnd => "stream_end",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Error => "error",
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Self::StreamStart | Self::StreamData | Self::StreamEnd)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownType(s.to_string()))
    }
}

/// Advisory priority ordinal. Transmitted as an integer; nothing in the
/// runtime reorders delivery based on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl From<u8> for MessagePriority {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Low,
            2 => Self::High,
            3 => Self::Critical,
            _ => Self::Normal,
        }
    }
}

impl From<MessagePriority> for u8 {
    fn from(p: MessagePriority) -> Self {
        match p {
            MessagePriority::Low => 0,
            MessagePriority::Normal => 1,
            MessagePriority::High => 2,
            MessagePriority::Critical => 3,
        }
    }
}

// ── Header ───────────────────────────────────────────────────────────

/// Envelope header.
///
/// `timestamp` is epoch milliseconds in memory; on the structured wire form
/// it is written as fractional epoch seconds, which is what the server side
/// of the protocol produces and expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    #[serde(default = "new_message_id")]
    pub message_id: String,
    #[serde(default = "d_request")]
    pub message_type: MessageType,
    #[serde(default = "now_millis", with = "epoch_seconds")]
    pub timestamp: i64,
    #[serde(default)]
    pub source_node: String,
    #[serde(default)]
    pub target_node: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default = "d_ttl")]
    pub ttl: u32,
}

impl MessageHeader {
    /// A header with a fresh id, the current time, `Normal` priority and the
    /// default TTL.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_id: new_message_id(),
            message_type,
            timestamp: now_millis(),
            source_node: String::new(),
            target_node: String::new(),
            correlation_id: None,
            priority: MessagePriority::Normal,
            ttl: DEFAULT_TTL_SECS,
        }
    }

    pub fn from_node(mut self, source: impl Into<String>) -> Self {
        self.source_node = source.into();
        self
    }

    pub fn to_node(mut self, target: impl Into<String>) -> Self {
        self.target_node = target.into();
        self
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl_secs: u32) -> Self {
        self.ttl = ttl_secs;
        self
    }

    /// `true` iff more than `ttl` seconds have elapsed between `timestamp`
    /// and `now_ms`.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms - self.timestamp > i64::from(self.ttl) * 1000
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self::new(MessageType::Request)
    }
}

// ── Reply ────────────────────────────────────────────────────────────

/// Outcome of a request, as carried in a `response` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(message.into()),
        }
    }

    /// Read `success` / `data` / `error` out of a payload. A missing
    /// `success` counts as success; a non-string `error` is stringified.
    pub fn from_payload(payload: &Payload) -> Self {
        let success = payload
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let data = payload.get("data").cloned().unwrap_or(Value::Null);
        let error = match payload.get("error") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        };
        Self {
            success,
            data,
            error,
        }
    }

    /// The payload of a `response` message: `data`, `success`, `error`
    /// (`null` when absent).
    pub fn into_payload(self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("data".into(), self.data);
        payload.insert("success".into(), Value::Bool(self.success));
        payload.insert(
            "error".into(),
            self.error.map(Value::String).unwrap_or(Value::Null),
        );
        payload
    }
}

// ── Message ──────────────────────────────────────────────────────────

/// Header plus body. `action` is meaningful for `request` and `event`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub header: MessageHeader,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub metadata: Payload,
}

impl Message {
    pub fn new(header: MessageHeader, action: impl Into<String>) -> Self {
        Self {
            header,
            action: action.into(),
            payload: Payload::new(),
            metadata: Payload::new(),
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn id(&self) -> &str {
        &self.header.message_id
    }

    /// Build a `request` for `action`.
    pub fn request(
        source: impl Into<String>,
        target: impl Into<String>,
        action: impl Into<String>,
        params: Payload,
        priority: MessagePriority,
    ) -> Self {
        let header = MessageHeader::new(MessageType::Request)
            .from_node(source)
            .to_node(target)
            .with_priority(priority);
        Self::new(header, action).with_payload(params)
    }

    /// Build the `response` to `request`: endpoints swapped, correlated by
    /// the request's message id.
    pub fn response_to(request: &Message, reply: Reply) -> Self {
        let header = MessageHeader::new(MessageType::Response)
            .from_node(request.header.target_node.clone())
            .to_node(request.header.source_node.clone())
            .with_correlation(request.header.message_id.clone());
        Self::new(header, request.action.clone()).with_payload(reply.into_payload())
    }

    /// Build an `event`. The event type is carried both as the action and as
    /// `metadata.event_type`.
    pub fn event(source: impl Into<String>, event_type: impl Into<String>, data: Payload) -> Self {
        let event_type = event_type.into();
        let mut metadata = Payload::new();
        metadata.insert("event_type".into(), Value::String(event_type.clone()));
        let header = MessageHeader::new(MessageType::Event).from_node(source);
        Self::new(header, event_type)
            .with_payload(data)
            .with_metadata(metadata)
    }

    /// Build the `pong` answering `ping`.
    pub fn pong_to(ping: &Message) -> Self {
        let header = MessageHeader::new(MessageType::Pong)
            .from_node(ping.header.target_node.clone())
            .to_node(ping.header.source_node.clone())
            .with_correlation(ping.header.message_id.clone());
        let mut payload = Payload::new();
        payload.insert("timestamp".into(), Value::from(now_millis()));
        Self::new(header, "pong").with_payload(payload)
    }

    /// Event type tag: `metadata.event_type`, falling back to `action`.
    pub fn event_type(&self) -> &str {
        self.metadata
            .get("event_type")
            .and_then(Value::as_str)
            .unwrap_or(&self.action)
    }

    /// The reply carried by a `response`; `None` for any other type.
    pub fn reply(&self) -> Option<Reply> {
        (self.header.message_type == MessageType::Response)
            .then(|| Reply::from_payload(&self.payload))
    }

    pub fn is_expired(&self) -> bool {
        self.header.is_expired()
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.header.is_expired_at(now_ms)
    }

    /// Structured wire form: `{"header", "action", "payload", "metadata"}`.
    pub fn to_json_string(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

// ── helpers ──────────────────────────────────────────────────────────

pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn d_request() -> MessageType {
    MessageType::Request
}

fn d_ttl() -> u32 {
    DEFAULT_TTL_SECS
}

/// Epoch milliseconds in memory, fractional epoch seconds on the wire.
mod epoch_seconds {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ms: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(*ms as f64 / 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok((secs * 1000.0).round() as i64)
    }
}
