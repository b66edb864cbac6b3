//! Inbound text frame classification.

use serde_json::Value;

use crate::adapter::SimpleEnvelope;
use crate::device::{DeviceMessage, DeviceMessageType};
use crate::envelope::{Message, MessageType};
use crate::error::ProtocolError;

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Structured form (`header` section present).
    Protocol(Message),
    /// Simple form (`id` present), converted to a [`Message`].
    Simple(Message),
    /// Device envelope (`device_id` present).
    Device(DeviceMessage),
}

impl Frame {
    /// Encode `msg` in the same form this frame arrived in. Device frames
    /// have no protocol form and answer in the structured form.
    pub fn encode_reply(&self, msg: &Message) -> Result<String, ProtocolError> {
        match self {
            Frame::Simple(_) => SimpleEnvelope::from(msg).to_json_string(),
            Frame::Protocol(_) | Frame::Device(_) => msg.to_json_string(),
        }
    }
}

/// Reject frames larger than `max` bytes before parsing them.
pub fn check_frame_size(text: &str, max: usize) -> Result<(), ProtocolError> {
    if text.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max,
        });
    }
    Ok(())
}

/// Classify and decode one text frame.
///
/// `header` wins over `device_id`, which wins over `id`. Type strings are
/// checked up front so an unknown type is reported as such rather than as a
/// generic JSON error.
pub fn decode_frame(text: &str) -> Result<Frame, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let Some(obj) = value.as_object() else {
        return Err(ProtocolError::InvalidFrame("expected a JSON object".into()));
    };

    if let Some(header) = obj.get("header") {
        if let Some(t) = header.get("message_type").and_then(Value::as_str) {
            t.parse::<MessageType>()?;
        }
        return Ok(Frame::Protocol(serde_json::from_value(value)?));
    }

    if obj.contains_key("device_id") {
        match obj.get("type").and_then(Value::as_str) {
            Some(t) => {
                t.parse::<DeviceMessageType>()?;
            }
            None => return Err(ProtocolError::InvalidFrame("device envelope without type".into())),
        }
        return Ok(Frame::Device(serde_json::from_value(value)?));
    }

    if obj.contains_key("id") {
        if let Some(t) = obj.get("type").and_then(Value::as_str) {
            t.parse::<MessageType>()?;
        }
        let simple: SimpleEnvelope = serde_json::from_value(value)?;
        return Ok(Frame::Simple(simple.into()));
    }

    Err(ProtocolError::InvalidFrame(
        "no header, device_id or id field".into(),
    ))
}
