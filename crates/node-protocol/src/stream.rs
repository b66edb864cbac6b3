//! Sequenced multi-chunk transfer on top of the envelope.
//!
//! A stream is one `stream_start` (sequence 0), any number of `stream_data`
//! chunks (1..=n) and one `stream_end` (n + 1, `is_final`). Nothing is
//! resent or reordered; the receiver reports any deviation as an error.

use serde_json::Value;

use crate::envelope::{new_message_id, Message, MessageHeader, MessageType, Payload};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream {0} already started")]
    AlreadyStarted(String),

    #[error("stream {0} not started")]
    NotStarted(String),

    #[error("stream {0} already ended")]
    AlreadyEnded(String),

    #[error("stream {stream_id}: expected sequence {expected}, got {got} (gap)")]
    SequenceGap {
        stream_id: String,
        expected: u64,
        got: u64,
    },

    #[error("stream {stream_id}: expected sequence {expected}, got {got} (out of order)")]
    OutOfOrder {
        stream_id: String,
        expected: u64,
        got: u64,
    },

    #[error("stream {stream_id}: start must carry sequence 0, got {got}")]
    UnexpectedStart { stream_id: String, got: u64 },

    #[error("malformed stream message: {0}")]
    Malformed(String),
}

// ── StreamMessage ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub header: MessageHeader,
    pub stream_id: String,
    pub sequence: u64,
    pub data: Value,
    pub is_final: bool,
}

impl StreamMessage {
    /// Payload is `{stream_id, sequence, data, is_final}`.
    pub fn to_message(&self) -> Message {
        let mut payload = Payload::new();
        payload.insert("stream_id".into(), Value::String(self.stream_id.clone()));
        payload.insert("sequence".into(), Value::from(self.sequence));
        payload.insert("data".into(), self.data.clone());
        payload.insert("is_final".into(), Value::Bool(self.is_final));
        Message::new(self.header.clone(), "").with_payload(payload)
    }

    pub fn from_message(msg: &Message) -> Result<Self, StreamError> {
        if !msg.header.message_type.is_stream() {
            return Err(StreamError::Malformed(format!(
                "{} is not a stream message",
                msg.header.message_type
            )));
        }
        let stream_id = msg
            .payload
            .get("stream_id")
            .and_then(Value::as_str)
            .ok_or_else(|| StreamError::Malformed("missing stream_id".into()))?
            .to_string();
        let sequence = msg
            .payload
            .get("sequence")
            .and_then(Value::as_u64)
            .ok_or_else(|| StreamError::Malformed(format!("stream {stream_id}: missing sequence")))?;
        let data = msg.payload.get("data").cloned().unwrap_or(Value::Null);
        let is_final = msg
            .payload
            .get("is_final")
            .and_then(Value::as_bool)
            .unwrap_or(msg.header.message_type == MessageType::StreamEnd);

        Ok(Self {
            header: msg.header.clone(),
            stream_id,
            sequence,
            data,
            is_final,
        })
    }

    pub fn kind(&self) -> MessageType {
        self.header.message_type
    }
}

// ── Sender side ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct StreamSession {
    stream_id: String,
    source: String,
    target: String,
    sequence: u64,
    started: bool,
    ended: bool,
}

impl StreamSession {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_id(new_message_id(), source, target)
    }

    pub fn with_id(
        stream_id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            source: source.into(),
            target: target.into(),
            sequence: 0,
            started: false,
            ended: false,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn start(&mut self) -> Result<StreamMessage, StreamError> {
        if self.ended {
            return Err(StreamError::AlreadyEnded(self.stream_id.clone()));
        }
        if self.started {
            return Err(StreamError::AlreadyStarted(self.stream_id.clone()));
        }
        self.started = true;
        Ok(self.chunk(MessageType::StreamStart, Value::Null, false))
    }

    pub fn send(&mut self, data: Value) -> Result<StreamMessage, StreamError> {
        self.ensure_open()?;
        self.sequence += 1;
        Ok(self.chunk(MessageType::StreamData, data, false))
    }

    /// Emit the final chunk. The session accepts nothing afterwards.
    pub fn end(&mut self, data: Option<Value>) -> Result<StreamMessage, StreamError> {
        self.ensure_open()?;
        self.sequence += 1;
        self.ended = true;
        Ok(self.chunk(MessageType::StreamEnd, data.unwrap_or(Value::Null), true))
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.ended {
            return Err(StreamError::AlreadyEnded(self.stream_id.clone()));
        }
        if !self.started {
            return Err(StreamError::NotStarted(self.stream_id.clone()));
        }
        Ok(())
    }

    fn chunk(&self, kind: MessageType, data: Value, is_final: bool) -> StreamMessage {
        StreamMessage {
            header: MessageHeader::new(kind)
                .from_node(self.source.clone())
                .to_node(self.target.clone()),
            stream_id: self.stream_id.clone(),
            sequence: self.sequence,
            data,
            is_final,
        }
    }
}

// ── Receiver side ────────────────────────────────────────────────────

/// Validates the chunks of one incoming stream.
#[derive(Debug)]
pub struct StreamReceiver {
    stream_id: String,
    next: u64,
    started: bool,
    ended: bool,
}

impl StreamReceiver {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            next: 0,
            started: false,
            ended: false,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Accept the next chunk or report why it is a violation. A rejected
    /// chunk leaves the receiver unchanged.
    pub fn accept(&mut self, chunk: &StreamMessage) -> Result<(), StreamError> {
        let id = || self.stream_id.clone();
        if chunk.stream_id != self.stream_id {
            return Err(StreamError::Malformed(format!(
                "chunk for stream {} delivered to {}",
                chunk.stream_id, self.stream_id
            )));
        }
        if self.ended {
            return Err(StreamError::AlreadyEnded(id()));
        }

        match chunk.kind() {
            MessageType::StreamStart => {
                if self.started {
                    return Err(StreamError::AlreadyStarted(id()));
                }
                if chunk.sequence != 0 {
                    return Err(StreamError::UnexpectedStart {
                        stream_id: id(),
                        got: chunk.sequence,
                    });
                }
                self.started = true;
                self.next = 1;
                Ok(())
            }
            MessageType::StreamData | MessageType::StreamEnd => {
                if !self.started {
                    return Err(StreamError::NotStarted(id()));
                }
                if chunk.sequence > self.next {
                    return Err(StreamError::SequenceGap {
                        stream_id: id(),
                        expected: self.next,
                        got: chunk.sequence,
                    });
                }
                if chunk.sequence < self.next {
                    return Err(StreamError::OutOfOrder {
                        stream_id: id(),
                        expected: self.next,
                        got: chunk.sequence,
                    });
                }
                self.next += 1;
                if chunk.kind() == MessageType::StreamEnd {
                    self.ended = true;
                }
                Ok(())
            }
            other => Err(StreamError::Malformed(format!("{other} is not a stream message"))),
        }
    }
}
