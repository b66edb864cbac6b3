//! Node-to-node message carried inside a device envelope.
//!
//! Routing fields travel as reserved payload keys so that the server can
//! forward the envelope without understanding it.

use serde_json::Value;

use crate::device::{DeviceMessage, DeviceMessageType};
use crate::envelope::{new_message_id, now_millis, Payload, BROADCAST_TARGET};

pub const DEFAULT_NODE_PRIORITY: u8 = 5;

const KEY_MESSAGE_ID: &str = "message_id";
const KEY_SOURCE_ID: &str = "source_id";
const KEY_TARGET_ID: &str = "target_id";
const KEY_PRIORITY: &str = "priority";

#[derive(Debug, Clone, PartialEq)]
pub struct NodeMessage {
    pub message_type: DeviceMessageType,
    pub source_id: String,
    pub target_id: String,
    pub payload: Payload,
    pub message_id: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// 1..=10, advisory.
    pub priority: u8,
}

impl NodeMessage {
    pub fn new(
        message_type: DeviceMessageType,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            message_type,
            source_id: source_id.into(),
            target_id: target_id.into(),
            payload,
            message_id: new_message_id(),
            timestamp: now_millis(),
            priority: DEFAULT_NODE_PRIORITY,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 10);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_id == BROADCAST_TARGET
    }

    /// Wrap into a device envelope sent on behalf of `source_id`.
    pub fn to_device(&self) -> DeviceMessage {
        let mut payload = self.payload.clone();
        payload.insert(KEY_MESSAGE_ID.into(), Value::String(self.message_id.clone()));
        payload.insert(KEY_SOURCE_ID.into(), Value::String(self.source_id.clone()));
        payload.insert(KEY_TARGET_ID.into(), Value::String(self.target_id.clone()));
        payload.insert(KEY_PRIORITY.into(), Value::from(self.priority));

        let mut msg = DeviceMessage::new(self.message_type, self.source_id.clone()).with_payload(payload);
        msg.message_id = self.message_id.clone();
        msg.timestamp = self.timestamp;
        msg
    }

    /// Unwrap a device envelope. The source falls back to `device_id`, the
    /// target to broadcast; the reserved keys are stripped from the payload.
    pub fn from_device(msg: &DeviceMessage) -> Self {
        let mut payload = msg.payload.clone();
        let take_str = |p: &mut Payload, key: &str| match p.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };

        let message_id = take_str(&mut payload, KEY_MESSAGE_ID).unwrap_or_else(|| msg.message_id.clone());
        let source_id = take_str(&mut payload, KEY_SOURCE_ID).unwrap_or_else(|| msg.device_id.clone());
        let target_id = take_str(&mut payload, KEY_TARGET_ID).unwrap_or_else(|| BROADCAST_TARGET.to_string());
        let priority = payload
            .remove(KEY_PRIORITY)
            .and_then(|v| v.as_u64())
            .and_then(|p| u8::try_from(p).ok())
            .unwrap_or(DEFAULT_NODE_PRIORITY);

        Self {
            message_type: msg.kind,
            source_id,
            target_id,
            payload,
            message_id,
            timestamp: msg.timestamp,
            priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn to_device_embeds_routing_keys() {
        let msg = NodeMessage::new(
            DeviceMessageType::NodeWakeup,
            "phone-1",
            "tablet-2",
            payload(json!({"reason": "sync"})),
        );
        let dev = msg.to_device();
        assert_eq!(dev.kind, DeviceMessageType::NodeWakeup);
        assert_eq!(dev.device_id, "phone-1");
        assert_eq!(dev.message_id, msg.message_id);
        assert_eq!(dev.payload["source_id"], "phone-1");
        assert_eq!(dev.payload["target_id"], "tablet-2");
        assert_eq!(dev.payload["priority"], 5);
        assert_eq!(dev.payload["reason"], "sync");
    }

    #[test]
    fn from_device_strips_routing_keys() {
        let original = NodeMessage::new(
            DeviceMessageType::Command,
            "server",
            "phone-1",
            payload(json!({"command": "open_app"})),
        )
        .with_priority(8);
        let back = NodeMessage::from_device(&original.to_device());
        assert_eq!(back, original);
        assert!(!back.payload.contains_key("source_id"));
    }

    #[test]
    fn from_device_falls_back_to_envelope_fields() {
        let dev = DeviceMessage::new(DeviceMessageType::EventBroadcast, "tablet-2")
            .with_payload(payload(json!({"event_type": "battery_low"})));
        let msg = NodeMessage::from_device(&dev);
        assert_eq!(msg.source_id, "tablet-2");
        assert!(msg.is_broadcast());
        assert_eq!(msg.message_id, dev.message_id);
        assert_eq!(msg.priority, DEFAULT_NODE_PRIORITY);
    }

    #[test]
    fn priority_is_clamped() {
        let m = NodeMessage::new(DeviceMessageType::Command, "a", "b", Payload::new()).with_priority(42);
        assert_eq!(m.priority, 10);
    }
}
