//! Node registry: known peer identities, local node handlers and event
//! subscriptions.
//!
//! Writers serialise on one mutex and publish a fresh snapshot; readers
//! clone the current snapshot `Arc` and never wait on a writer.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use gx_protocol::Payload;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::handler::NodeHandler;
use crate::types::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Server,
    Android,
    Ios,
    Web,
    Desktop,
    Embedded,
    Cloud,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Android => "android",
            Self::Ios => "ios",
            Self::Web => "web",
            Self::Desktop => "desktop",
            Self::Embedded => "embedded",
            Self::Cloud => "cloud",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "android" => Ok(Self::Android),
            "ios" => Ok(Self::Ios),
            "web" => Ok(Self::Web),
            "desktop" => Ok(Self::Desktop),
            "embedded" => Ok(Self::Embedded),
            "cloud" => Ok(Self::Cloud),
            other => Err(format!("unknown node kind: {other}")),
        }
    }
}

/// A known participant in the messaging network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    #[serde(rename = "node_type")]
    pub kind: NodeKind,
    #[serde(rename = "node_name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: Payload,
}

impl NodeIdentity {
    pub fn new(node_id: impl Into<String>, kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            kind,
            name: name.into(),
            host: None,
            port: None,
            capabilities: Vec::new(),
            metadata: Payload::new(),
        }
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }

    pub fn with_capabilities(mut self, caps: impl Into<Vec<String>>) -> Self {
        self.capabilities = caps.into();
        self
    }
}

#[derive(Clone)]
struct Entry {
    identity: NodeIdentity,
    handler: Option<Arc<dyn NodeHandler>>,
}

#[derive(Clone, Default)]
struct Snapshot {
    nodes: HashMap<String, Entry>,
    subscriptions: HashMap<String, BTreeSet<String>>,
}

#[derive(Default)]
pub struct NodeRegistry {
    write: Mutex<()>,
    current: RwLock<Arc<Snapshot>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read())
    }

    /// Apply `f` to a copy of the current snapshot and publish the result.
    fn mutate<T>(&self, f: impl FnOnce(&mut Snapshot) -> T) -> T {
        let _guard = self.write.lock();
        let mut next = (*self.snapshot()).clone();
        let out = f(&mut next);
        *self.current.write() = Arc::new(next);
        out
    }

    /// Register (or replace) a node. A `handler` makes it a local node:
    /// messages to it are delivered in-process.
    pub fn register(&self, identity: NodeIdentity, handler: Option<Arc<dyn NodeHandler>>) {
        tracing::info!(
            node_id = %identity.node_id,
            node_type = %identity.kind,
            local = handler.is_some(),
            "node registered"
        );
        self.mutate(|s| {
            s.nodes.insert(identity.node_id.clone(), Entry { identity, handler });
        });
    }

    /// Remove the identity and handler of `node_id`. Its subscriptions are
    /// left in place until unsubscribed.
    pub fn unregister(&self, node_id: &str) -> Result<NodeIdentity, RegistryError> {
        let removed = self.mutate(|s| s.nodes.remove(node_id));
        match removed {
            Some(entry) => {
                tracing::info!(node_id = %node_id, "node unregistered");
                Ok(entry.identity)
            }
            None => Err(RegistryError::NotFound(node_id.to_string())),
        }
    }

    pub fn get(&self, node_id: &str) -> Option<NodeIdentity> {
        self.snapshot().nodes.get(node_id).map(|e| e.identity.clone())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.snapshot().nodes.contains_key(node_id)
    }

    /// Handler of a local node, `None` for remote or unknown nodes.
    pub fn local_handler(&self, node_id: &str) -> Option<Arc<dyn NodeHandler>> {
        self.snapshot().nodes.get(node_id).and_then(|e| e.handler.clone())
    }

    pub fn is_local(&self, node_id: &str) -> bool {
        self.local_handler(node_id).is_some()
    }

    /// Every registered node, sorted by id.
    pub fn all(&self) -> Vec<NodeIdentity> {
        let snap = self.snapshot();
        let mut nodes: Vec<NodeIdentity> = snap.nodes.values().map(|e| e.identity.clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn by_kind(&self, kind: NodeKind) -> Vec<NodeIdentity> {
        self.all().into_iter().filter(|n| n.kind == kind).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Subscriptions ────────────────────────────────────────────────

    pub fn subscribe(&self, node_id: &str, event_type: &str) -> Result<(), RegistryError> {
        self.mutate(|s| {
            if !s.nodes.contains_key(node_id) {
                return Err(RegistryError::NotFound(node_id.to_string()));
            }
            s.subscriptions
                .entry(event_type.to_string())
                .or_default()
                .insert(node_id.to_string());
            Ok(())
        })?;
        tracing::debug!(node_id = %node_id, event_type = %event_type, "subscribed");
        Ok(())
    }

    /// Remove a subscription. Works for nodes that are no longer
    /// registered; returns whether anything was removed.
    pub fn unsubscribe(&self, node_id: &str, event_type: &str) -> bool {
        self.mutate(|s| {
            let Some(set) = s.subscriptions.get_mut(event_type) else {
                return false;
            };
            let removed = set.remove(node_id);
            if set.is_empty() {
                s.subscriptions.remove(event_type);
            }
            removed
        })
    }

    /// Subscribers of `event_type`, sorted.
    pub fn subscribers(&self, event_type: &str) -> Vec<String> {
        self.snapshot()
            .subscriptions
            .get(event_type)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}
