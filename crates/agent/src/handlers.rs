//! Built-in actions of the reference agent.

use chrono::Utc;
use gx_node_sdk::{
    ActionContext, ActionHandler, Event, EventListener, HandlerError, HandlerResult, Payload, StreamHandler,
    StreamMessage,
};
use serde_json::{json, Value};

/// `ping`: answer with the local time.
///
/// Returns: `{ "pong": true, "timestamp": <epoch ms> }`
pub struct Ping;

#[async_trait::async_trait]
impl ActionHandler for Ping {
    async fn call(&self, _ctx: ActionContext, _payload: Payload) -> HandlerResult {
        Ok(json!({
            "pong": true,
            "timestamp": Utc::now().timestamp_millis(),
        }))
    }
}

/// `echo`: return the payload unchanged.
pub struct Echo;

#[async_trait::async_trait]
impl ActionHandler for Echo {
    async fn call(&self, _ctx: ActionContext, payload: Payload) -> HandlerResult {
        Ok(Value::Object(payload))
    }
}

/// `device_info`: describe this node.
///
/// Args: `{ "fields": ["node_id", ...] }` (optional, all fields by default)
pub struct DeviceInfo {
    pub node_id: String,
    pub name: String,
    pub device_type: String,
    pub capabilities: Vec<String>,
}

#[async_trait::async_trait]
impl ActionHandler for DeviceInfo {
    async fn call(&self, ctx: ActionContext, payload: Payload) -> HandlerResult {
        let info = json!({
            "node_id": self.node_id,
            "name": self.name,
            "device_type": self.device_type,
            "capabilities": self.capabilities,
            "requested_by": ctx.source,
            "agent_version": env!("CARGO_PKG_VERSION"),
        });

        let Some(fields) = payload.get("fields") else {
            return Ok(info);
        };
        let fields = fields
            .as_array()
            .ok_or_else(|| HandlerError::InvalidArgs("'fields' must be an array".into()))?;

        let mut out = Payload::new();
        for field in fields {
            let name = field
                .as_str()
                .ok_or_else(|| HandlerError::InvalidArgs("'fields' entries must be strings".into()))?;
            let value = info
                .get(name)
                .ok_or_else(|| HandlerError::NotFound(format!("unknown field '{name}'")))?;
            out.insert(name.to_string(), value.clone());
        }
        Ok(Value::Object(out))
    }
}

/// Logs every event it receives.
pub struct LogEvents;

#[async_trait::async_trait]
impl EventListener for LogEvents {
    async fn on_event(&self, event: Event) -> Result<(), HandlerError> {
        tracing::info!(
            event_type = %event.event_type,
            source = %event.source,
            keys = event.data.len(),
            "event received"
        );
        Ok(())
    }
}

/// Logs stream progress. Media payloads are not decoded here.
pub struct LogStreams;

#[async_trait::async_trait]
impl StreamHandler for LogStreams {
    async fn on_chunk(&self, chunk: StreamMessage) -> Result<(), HandlerError> {
        tracing::debug!(
            stream_id = %chunk.stream_id,
            sequence = chunk.sequence,
            is_final = chunk.is_final,
            "stream chunk"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn ctx(action: &str) -> ActionContext {
        ActionContext::new("m-1", action, "server", "phone", CancellationToken::new())
    }

    fn info() -> DeviceInfo {
        DeviceInfo {
            node_id: "phone".into(),
            name: "Phone".into(),
            device_type: "android".into(),
            capabilities: vec!["gui_click".into()],
        }
    }

    #[tokio::test]
    async fn ping_reports_pong() {
        let v = Ping.call(ctx("ping"), Payload::new()).await.unwrap();
        assert_eq!(v["pong"], true);
        assert!(v["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn echo_returns_payload() {
        let payload = json!({"a": [1, 2]}).as_object().cloned().unwrap();
        let v = Echo.call(ctx("echo"), payload).await.unwrap();
        assert_eq!(v, json!({"a": [1, 2]}));
    }

    #[tokio::test]
    async fn device_info_full_and_selected() {
        let full = info().call(ctx("device_info"), Payload::new()).await.unwrap();
        assert_eq!(full["node_id"], "phone");
        assert_eq!(full["capabilities"], json!(["gui_click"]));
        assert_eq!(full["requested_by"], "server");

        let payload = json!({"fields": ["name", "device_type"]}).as_object().cloned().unwrap();
        let some = info().call(ctx("device_info"), payload).await.unwrap();
        assert_eq!(some, json!({"name": "Phone", "device_type": "android"}));
    }

    #[tokio::test]
    async fn device_info_rejects_bad_fields() {
        let payload = json!({"fields": "name"}).as_object().cloned().unwrap();
        let err = info().call(ctx("device_info"), payload).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidArgs(_)));

        let payload = json!({"fields": ["imei"]}).as_object().cloned().unwrap();
        let err = info().call(ctx("device_info"), payload).await.unwrap_err();
        assert_eq!(err.to_string(), "not_found: unknown field 'imei'");
    }
}
