//! Device-facing wire envelope exchanged with the orchestration server.
//!
//! The `type` strings and field names here are an external contract and are
//! reproduced exactly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use crate::envelope::{new_message_id, now_millis, Payload};
use crate::error::ProtocolError;

/// Version string written into every device envelope.
pub const PROTOCOL_VERSION: &str = "3.0";

macro_rules! device_message_types {
    ($($variant:ident => $wire:literal),+ $(,)?) => {
        /// Device-facing message vocabulary.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum DeviceMessageType {
            $($variant),+
        }

        impl DeviceMessageType {
            pub const ALL: &'static [DeviceMessageType] = &[$(DeviceMessageType::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(DeviceMessageType::$variant => $wire),+
                }
            }
        }
    };
}

device_message_types! {
    // device management
    DeviceRegister => "device_register",
    DeviceRegisterAck => "device_register_ack",
    DeviceUnregister => "device_unregister",
    Heartbeat => "heartbeat",
    HeartbeatAck => "heartbeat_ack",
    DeviceStatus => "device_status",
    DeviceCapabilities => "device_capabilities",
    // tasks
    TaskSubmit => "task_submit",
    TaskAssign => "task_assign",
    TaskStatus => "task_status",
    TaskResult => "task_result",
    TaskCancel => "task_cancel",
    TaskProgress => "task_progress",
    TaskEnd => "task_end",
    // commands
    Command => "command",
    CommandResult => "command_result",
    CommandBatch => "command_batch",
    // gui
    GuiClick => "gui_click",
    GuiSwipe => "gui_swipe",
    GuiInput => "gui_input",
    GuiScroll => "gui_scroll",
    GuiScreenshot => "gui_screenshot",
    GuiElementQuery => "gui_element_query",
    GuiElementWait => "gui_element_wait",
    GuiScreenContent => "gui_screen_content",
    // screen / media
    ScreenCapture => "screen_capture",
    ScreenStreamStart => "screen_stream_start",
    ScreenStreamStop => "screen_stream_stop",
    ScreenStreamData => "screen_stream_data",
    // files
    FileRead => "file_read",
    FileWrite => "file_write",
    FileDelete => "file_delete",
    FileList => "file_list",
    FileTransfer => "file_transfer",
    // processes
    ProcessStart => "process_start",
    ProcessStop => "process_stop",
    ProcessList => "process_list",
    ProcessStatus => "process_status",
    // coordination
    CoordSync => "coord_sync",
    CoordBroadcast => "coord_broadcast",
    CoordLock => "coord_lock",
    CoordUnlock => "coord_unlock",
    // node control
    NodeActivate => "node_activate",
    NodeWakeup => "node_wakeup",
    NodeSleep => "node_sleep",
    // events / errors
    EventBroadcast => "event_broadcast",
    Error => "error",
    ErrorRecovery => "error_recovery",
}

impl fmt::Display for DeviceMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceMessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownType(s.to_string()))
    }
}

impl Serialize for DeviceMessageType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DeviceMessageType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ── Task / command records ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Continue,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
    Skipped,
    Timeout,
    #[default]
    None,
}

/// A single tool invocation inside a `commands[]` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default = "new_message_id")]
    pub command_id: String,
    pub tool_name: String,
    #[serde(default = "d_tool_type")]
    pub tool_type: String,
    #[serde(default)]
    pub parameters: Payload,
    /// Seconds.
    #[serde(default = "d_command_timeout")]
    pub timeout: u32,
}

impl Command {
    pub fn new(tool_name: impl Into<String>, parameters: Payload) -> Self {
        Self {
            command_id: new_message_id(),
            tool_name: tool_name.into(),
            tool_type: d_tool_type(),
            parameters,
            timeout: d_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    #[serde(default)]
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub execution_time: f64,
}

// ── Envelope ─────────────────────────────────────────────────────────

/// Device envelope. Field order follows the server contract; optional
/// fields and empty `commands` / `results` lists are omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMessage {
    #[serde(default = "d_version")]
    pub version: String,
    #[serde(default = "new_message_id")]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: DeviceMessageType,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// Epoch milliseconds.
    #[serde(default = "now_millis")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<Command>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<CommandResult>,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeviceMessage {
    pub fn new(kind: DeviceMessageType, device_id: impl Into<String>) -> Self {
        Self {
            version: d_version(),
            message_id: new_message_id(),
            correlation_id: None,
            kind,
            device_id: device_id.into(),
            device_type: None,
            timestamp: now_millis(),
            task_id: None,
            task_status: None,
            commands: Vec::new(),
            results: Vec::new(),
            payload: Payload::new(),
            error: None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// `device_register`, sent once per successful connection.
    pub fn register(
        device_id: impl Into<String>,
        device_type: impl Into<String>,
        name: &str,
        capabilities: &[String],
    ) -> Self {
        let device_id = device_id.into();
        let device_type = device_type.into();
        let info = json!({
            "device_id": device_id,
            "device_type": device_type,
            "name": name,
            "capabilities": capabilities,
        });
        let mut payload = Payload::new();
        payload.insert("device_info".into(), info);

        let mut msg = Self::new(DeviceMessageType::DeviceRegister, device_id).with_payload(payload);
        msg.device_type = Some(device_type);
        msg
    }

    pub fn heartbeat(device_id: impl Into<String>) -> Self {
        Self::new(DeviceMessageType::Heartbeat, device_id)
    }

    pub fn error(
        device_id: impl Into<String>,
        error: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Self {
        let mut msg = Self::new(DeviceMessageType::Error, device_id);
        msg.correlation_id = correlation_id;
        msg.error = Some(error.into());
        msg
    }

    pub fn task_result(
        device_id: impl Into<String>,
        task_id: impl Into<String>,
        status: TaskStatus,
        results: Vec<CommandResult>,
    ) -> Self {
        let mut msg = Self::new(DeviceMessageType::TaskResult, device_id);
        msg.task_id = Some(task_id.into());
        msg.task_status = Some(status);
        msg.results = results;
        msg
    }

    pub fn command_result(device_id: impl Into<String>, result: CommandResult) -> Self {
        let mut msg = Self::new(DeviceMessageType::CommandResult, device_id);
        msg.results = vec![result];
        msg
    }

    pub fn to_json_string(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

fn d_version() -> String {
    PROTOCOL_VERSION.into()
}

fn d_tool_type() -> String {
    "action".into()
}

fn d_command_timeout() -> u32 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_type_strings_are_verbatim() {
        // A sample across every group of the vocabulary.
        let expected = [
            (DeviceMessageType::DeviceRegister, "device_register"),
            (DeviceMessageType::HeartbeatAck, "heartbeat_ack"),
            (DeviceMessageType::TaskProgress, "task_progress"),
            (DeviceMessageType::CommandBatch, "command_batch"),
            (DeviceMessageType::GuiElementQuery, "gui_element_query"),
            (DeviceMessageType::ScreenStreamData, "screen_stream_data"),
            (DeviceMessageType::FileTransfer, "file_transfer"),
            (DeviceMessageType::ProcessStatus, "process_status"),
            (DeviceMessageType::CoordUnlock, "coord_unlock"),
            (DeviceMessageType::NodeWakeup, "node_wakeup"),
            (DeviceMessageType::EventBroadcast, "event_broadcast"),
            (DeviceMessageType::ErrorRecovery, "error_recovery"),
        ];
        for (kind, wire) in expected {
            assert_eq!(serde_json::to_value(kind).unwrap(), Value::String(wire.into()));
            assert_eq!(wire.parse::<DeviceMessageType>().unwrap(), kind);
        }
    }

    #[test]
    fn every_type_parses_back_from_its_wire_name() {
        for kind in DeviceMessageType::ALL {
            assert_eq!(kind.as_str().parse::<DeviceMessageType>().unwrap(), *kind);
        }
        assert_eq!(DeviceMessageType::ALL.len(), 48);
    }

    #[test]
    fn envelope_omits_empty_optionals() {
        let msg = DeviceMessage::heartbeat("phone-1");
        let v = serde_json::to_value(&msg).unwrap();
        let obj = v.as_object().unwrap();
        assert_eq!(obj["version"], "3.0");
        assert_eq!(obj["type"], "heartbeat");
        assert_eq!(obj["device_id"], "phone-1");
        assert!(obj["timestamp"].is_i64());
        assert!(obj["payload"].is_object());
        for absent in ["correlation_id", "device_type", "task_id", "task_status", "commands", "results", "error"] {
            assert!(!obj.contains_key(absent), "{absent} should be omitted");
        }
    }

    #[test]
    fn field_order_follows_contract() {
        let mut msg = DeviceMessage::error("phone-1", "boom", Some("req-9".into()));
        msg.device_type = Some("android".into());
        let text = msg.to_json_string().unwrap();
        let order = ["\"version\"", "\"message_id\"", "\"correlation_id\"", "\"type\"", "\"device_id\"", "\"device_type\"", "\"timestamp\"", "\"payload\"", "\"error\""];
        let positions: Vec<usize> = order.iter().map(|k| text.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{text}");
    }

    #[test]
    fn register_carries_device_info() {
        let msg = DeviceMessage::register("phone-1", "android", "Pixel", &["gui_click".to_string()]);
        assert_eq!(msg.kind, DeviceMessageType::DeviceRegister);
        assert_eq!(msg.device_type.as_deref(), Some("android"));
        assert_eq!(msg.payload["device_info"]["device_id"], "phone-1");
        assert_eq!(msg.payload["device_info"]["capabilities"][0], "gui_click");
    }

    #[test]
    fn decode_applies_defaults() {
        let msg: DeviceMessage = serde_json::from_str(
            r#"{"type":"task_assign","device_id":"srv","commands":[{"tool_name":"gui_click"}]}"#,
        )
        .unwrap();
        assert_eq!(msg.version, "3.0");
        assert!(!msg.message_id.is_empty());
        assert_eq!(msg.commands[0].tool_type, "action");
        assert_eq!(msg.commands[0].timeout, 30);
        assert!(!msg.commands[0].command_id.is_empty());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = serde_json::from_str::<DeviceMessage>(r#"{"type":"warp_drive","device_id":"x"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("unknown message type: warp_drive"));
    }

    #[test]
    fn task_result_and_command_result() {
        let r = CommandResult {
            command_id: "c1".into(),
            status: ResultStatus::Success,
            result: Some(json!({"clicked": true})),
            error: None,
            execution_time: 0.25,
        };
        let task = DeviceMessage::task_result("phone-1", "t1", TaskStatus::Completed, vec![r.clone()]);
        let v = serde_json::to_value(&task).unwrap();
        assert_eq!(v["task_status"], "completed");
        assert_eq!(v["results"][0]["status"], "success");
        assert!(v["results"][0].get("error").is_none());

        let cmd = DeviceMessage::command_result("phone-1", r);
        assert_eq!(cmd.kind, DeviceMessageType::CommandResult);
        assert_eq!(cmd.results.len(), 1);
    }
}
