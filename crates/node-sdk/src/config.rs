//! Agent configuration: TOML file first, then `GX_*` environment overrides.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::reconnect::ReconnectPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "d_gateway_url")]
    pub gateway_url: String,
    #[serde(default = "d_node_id")]
    pub node_id: String,
    #[serde(default = "d_node_name")]
    pub node_name: String,
    #[serde(default = "d_device_type")]
    pub device_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "d_30")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "d_5000")]
    pub reconnect_base_delay_ms: u64,
    /// `0` retries forever.
    #[serde(default = "d_10")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "d_30000")]
    pub request_timeout_ms: u64,
    #[serde(default = "d_16")]
    pub max_concurrent_handlers: usize,
    #[serde(default = "d_256k")]
    pub max_frame_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            gateway_url: d_gateway_url(),
            node_id: d_node_id(),
            node_name: d_node_name(),
            device_type: d_device_type(),
            capabilities: Vec::new(),
            heartbeat_interval_secs: d_30(),
            reconnect_base_delay_ms: d_5000(),
            max_reconnect_attempts: d_10(),
            request_timeout_ms: d_30000(),
            max_concurrent_handlers: d_16(),
            max_frame_bytes: d_256k(),
        }
    }
}

fn d_gateway_url() -> String {
    "ws://localhost:8765/ws/device".into()
}
fn d_node_id() -> String {
    "android-node".into()
}
fn d_node_name() -> String {
    "galaxy-agent".into()
}
fn d_device_type() -> String {
    "android".into()
}
fn d_30() -> u64 {
    30
}
fn d_5000() -> u64 {
    5000
}
fn d_10() -> u32 {
    10
}
fn d_30000() -> u64 {
    30_000
}
fn d_16() -> usize {
    16
}
fn d_256k() -> usize {
    256 * 1024
}

// ── Loading ──────────────────────────────────────────────────────────

impl AgentConfig {
    /// Load from the file named by `GX_CONFIG` (`agent.toml` by default),
    /// falling back to defaults when it does not exist, then apply
    /// environment overrides. Returns the config and the path consulted.
    pub fn load() -> anyhow::Result<(Self, String)> {
        let path = std::env::var("GX_CONFIG").unwrap_or_else(|_| "agent.toml".into());
        let mut config = Self::load_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok((config, path))
    }

    /// Read `path` as TOML, or return defaults if it does not exist.
    pub fn load_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Apply `GX_*` overrides from `lookup`. Values that fail to parse are
    /// logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("GX_GATEWAY_URL") {
            self.gateway_url = v;
        }
        if let Some(v) = lookup("GX_NODE_ID") {
            self.node_id = v;
        }
        if let Some(v) = lookup("GX_NODE_NAME") {
            self.node_name = v;
        }
        if let Some(v) = lookup("GX_DEVICE_TYPE") {
            self.device_type = v;
        }
        override_num(&lookup, "GX_HEARTBEAT_SECS", &mut self.heartbeat_interval_secs);
        override_num(&lookup, "GX_RECONNECT_BASE_MS", &mut self.reconnect_base_delay_ms);
        override_num(&lookup, "GX_RECONNECT_MAX_ATTEMPTS", &mut self.max_reconnect_attempts);
        override_num(&lookup, "GX_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

fn override_num<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable override"),
    }
}

// ── Validation ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl AgentConfig {
    /// Empty when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let mut error = |field: &str, message: &str| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message: message.into(),
            })
        };

        if self.gateway_url.trim().is_empty() {
            error("gateway_url", "gateway_url must not be empty");
        }
        if self.node_id.trim().is_empty() {
            error("node_id", "node_id must not be empty");
        }
        if self.heartbeat_interval_secs == 0 {
            error("heartbeat_interval_secs", "heartbeat interval must be greater than 0");
        }
        if self.max_concurrent_handlers == 0 {
            error("max_concurrent_handlers", "must allow at least one handler");
        }

        if !self.gateway_url.starts_with("ws://") && !self.gateway_url.starts_with("wss://") {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "gateway_url".into(),
                message: format!("{} is not a ws:// or wss:// url", self.gateway_url),
            });
        }
        if self.max_reconnect_attempts == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "max_reconnect_attempts".into(),
                message: "0 means the agent reconnects forever".into(),
            });
        }
        issues
    }

    /// Whether `validate` found anything fatal.
    pub fn has_errors(issues: &[ConfigIssue]) -> bool {
        issues.iter().any(|i| i.severity == ConfigSeverity::Error)
    }
}
