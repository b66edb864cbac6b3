//! Simple transport form: `{id, type, action, data, timestamp, source, target}`.
//!
//! Used by peers that do not speak the structured form. Field values cross
//! the boundary unchanged; the simple form has no slot for a correlation id
//! or metadata, so those are lost on the way out and empty on the way in.

use serde::{Deserialize, Serialize};

use crate::envelope::{
    new_message_id, now_millis, Message, MessageHeader, MessageType, Payload,
};
use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleEnvelope {
    #[serde(default = "new_message_id")]
    pub id: String,
    #[serde(rename = "type", default = "d_request")]
    pub message_type: MessageType,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub data: Payload,
    /// Epoch milliseconds.
    #[serde(default = "now_millis")]
    pub timestamp: i64,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
}

impl SimpleEnvelope {
    pub fn to_json_string(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<&Message> for SimpleEnvelope {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.header.message_id.clone(),
            message_type: msg.header.message_type,
            action: msg.action.clone(),
            data: msg.payload.clone(),
            timestamp: msg.header.timestamp,
            source: msg.header.source_node.clone(),
            target: msg.header.target_node.clone(),
        }
    }
}

impl From<SimpleEnvelope> for Message {
    fn from(env: SimpleEnvelope) -> Self {
        let mut header = MessageHeader::new(env.message_type)
            .from_node(env.source)
            .to_node(env.target);
        header.message_id = env.id;
        header.timestamp = env.timestamp;
        Message::new(header, env.action).with_payload(env.data)
    }
}

fn d_request() -> MessageType {
    MessageType::Request
}
