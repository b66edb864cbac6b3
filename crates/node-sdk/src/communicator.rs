//! Communicator: node-to-node sends, broadcast, events and streams on top
//! of the registry, the router and the live link.
//!
//! Sends never fail with an error. Timeouts and transport trouble come
//! back as [`SendResult`] values so callers can tell "no answer" from
//! "answered with a failure".

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use gx_protocol::{
    DeviceMessage, DeviceMessageType, Message, NodeMessage, Payload, Reply, StreamMessage, StreamSession,
    BROADCAST_TARGET, SELF_TARGET,
};
use serde_json::Value;

use crate::connection::Link;
use crate::handler::{ActionContext, EventListener, NodeHandler};
use crate::pending::{PendingRequests, WaitOutcome};
use crate::registry::{NodeKind, NodeRegistry};
use crate::router::MessageRouter;
use crate::types::{BroadcastReport, SendOptions, SendResult};

/// Payload key that marks an inbound device envelope as a response.
pub const ORIGINAL_MESSAGE_ID: &str = "original_message_id";

pub struct Communicator {
    node_id: String,
    registry: Arc<NodeRegistry>,
    router: Arc<MessageRouter>,
    pending: Arc<PendingRequests>,
    link: Arc<dyn Link>,
    default_timeout: Duration,
}

impl Communicator {
    pub fn new(
        node_id: impl Into<String>,
        registry: Arc<NodeRegistry>,
        router: Arc<MessageRouter>,
        link: Arc<dyn Link>,
        default_timeout: Duration,
    ) -> Self {
        let pending = Arc::clone(router.pending());
        Self {
            node_id: node_id.into(),
            registry,
            router,
            pending,
            link,
            default_timeout,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    // ── Point-to-point ───────────────────────────────────────────────

    /// Send `payload` from `source` to `target`.
    ///
    /// `"self"` resolves to `source` and `"*"` broadcasts. Nodes registered
    /// with a local handler answer in-process with no timeout; anything
    /// else goes over the link as a device envelope.
    pub async fn send_to_node(
        &self,
        source: &str,
        target: &str,
        kind: DeviceMessageType,
        payload: Payload,
        opts: SendOptions,
    ) -> SendResult {
        let target = if target == SELF_TARGET { source } else { target };
        if target == BROADCAST_TARGET {
            return SendResult::Broadcast(self.broadcast(source, kind, payload, None).await);
        }

        let msg = NodeMessage::new(kind, source, target, payload).with_priority(opts.priority);
        if let Some(handler) = self.registry.local_handler(target) {
            tracing::debug!(
                message_id = %msg.message_id,
                target = %target,
                message_type = %kind,
                "delivering locally"
            );
            return SendResult::Replied(deliver_local(handler, msg).await);
        }
        self.send_remote(msg, &opts).await
    }

    /// Send to the orchestration server's node id. Same contract as
    /// [`send_to_node`](Self::send_to_node).
    pub async fn send_to_server(
        &self,
        source: &str,
        server_id: &str,
        kind: DeviceMessageType,
        payload: Payload,
        wait_response: bool,
    ) -> SendResult {
        let opts = if wait_response {
            SendOptions::wait()
        } else {
            SendOptions::fire_and_forget()
        };
        self.send_to_node(source, server_id, kind, payload, opts).await
    }

    async fn send_remote(&self, msg: NodeMessage, opts: &SendOptions) -> SendResult {
        let message_id = msg.message_id.clone();
        let text = match msg.to_device().to_json_string() {
            Ok(t) => t,
            Err(e) => {
                return SendResult::Undelivered {
                    message_id,
                    reason: e.to_string(),
                }
            }
        };

        if !opts.wait_response {
            return match self.link.send_frame(text).await {
                Ok(()) => SendResult::Delivered { message_id },
                Err(e) => {
                    tracing::debug!(message_id = %message_id, target = %msg.target_id, error = %e, "send failed");
                    SendResult::Undelivered {
                        message_id,
                        reason: e.to_string(),
                    }
                }
            };
        }

        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        // Registered before the frame leaves so a fast reply cannot miss it.
        let waiter = self.pending.register(message_id.clone(), timeout);
        if let Err(e) = self.link.send_frame(text).await {
            tracing::debug!(message_id = %message_id, target = %msg.target_id, error = %e, "send failed");
            drop(waiter);
            return SendResult::Undelivered {
                message_id,
                reason: e.to_string(),
            };
        }

        match waiter.wait().await {
            WaitOutcome::Reply(reply) => SendResult::Replied(reply),
            WaitOutcome::TimedOut => {
                tracing::warn!(
                    message_id = %message_id,
                    target = %msg.target_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                SendResult::TimedOut { message_id, timeout }
            }
            WaitOutcome::Dropped => SendResult::Undelivered {
                message_id,
                reason: "pending request dropped".into(),
            },
        }
    }

    // ── Fan-out ──────────────────────────────────────────────────────

    /// Deliver to every registered node except `source`, optionally only
    /// to nodes of the listed kinds. Never waits for remote responses; one
    /// node's failure does not stop delivery to the rest.
    pub async fn broadcast(
        &self,
        source: &str,
        kind: DeviceMessageType,
        payload: Payload,
        filter: Option<&[NodeKind]>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for node in self.registry.all() {
            if node.node_id == source {
                continue;
            }
            if let Some(kinds) = filter {
                if !kinds.contains(&node.kind) {
                    continue;
                }
            }

            let msg = NodeMessage::new(kind, source, node.node_id.clone(), payload.clone());
            let delivered = match self.registry.local_handler(&node.node_id) {
                Some(handler) => deliver_local(handler, msg).await.success,
                None => self.send_remote(msg, &SendOptions::fire_and_forget()).await.is_success(),
            };
            if delivered {
                report.success.push(node.node_id);
            } else {
                report.failed.push(node.node_id);
            }
        }

        tracing::debug!(
            message_type = %kind,
            delivered = report.success.len(),
            failed = report.failed.len(),
            "broadcast finished"
        );
        report
    }

    // ── Named wrappers ───────────────────────────────────────────────

    /// Ask this node to run `action` on itself.
    pub async fn activate_self(&self, node_id: &str, action: &str, params: Payload) -> SendResult {
        let mut payload = Payload::new();
        payload.insert("action".into(), Value::String(action.to_string()));
        payload.insert("params".into(), Value::Object(params));
        self.send_to_node(node_id, node_id, DeviceMessageType::NodeActivate, payload, SendOptions::wait())
            .await
    }

    pub async fn wakeup_node(&self, source: &str, target: &str, reason: &str, params: Payload) -> SendResult {
        let mut payload = Payload::new();
        payload.insert("reason".into(), Value::String(reason.to_string()));
        payload.insert("params".into(), Value::Object(params));
        self.send_to_node(source, target, DeviceMessageType::NodeWakeup, payload, SendOptions::wait())
            .await
    }

    pub async fn execute_command(
        &self,
        source: &str,
        target: &str,
        command: &str,
        args: Vec<Value>,
        kwargs: Payload,
        timeout: Duration,
    ) -> SendResult {
        let mut payload = Payload::new();
        payload.insert("command".into(), Value::String(command.to_string()));
        payload.insert("args".into(), Value::Array(args));
        payload.insert("kwargs".into(), Value::Object(kwargs));
        let opts = SendOptions::wait().with_timeout(timeout);
        self.send_to_node(source, target, DeviceMessageType::Command, payload, opts)
            .await
    }

    // ── Events ───────────────────────────────────────────────────────

    /// Register a listener on this node for `event_type`.
    pub fn on_event<L: EventListener>(&self, event_type: impl Into<String>, listener: L) {
        self.router.add_listener(event_type, listener);
    }

    /// Send `event_broadcast` to every subscriber of `event_type`, then run
    /// this node's own listeners once.
    pub async fn publish_event(&self, source: &str, event_type: &str, data: Payload) -> BroadcastReport {
        let mut body = Payload::new();
        body.insert("event_type".into(), Value::String(event_type.to_string()));
        body.insert("data".into(), Value::Object(data.clone()));

        let mut report = BroadcastReport::default();
        for subscriber in self.registry.subscribers(event_type) {
            // Our own listeners run below.
            if subscriber == self.node_id {
                report.success.push(subscriber);
                continue;
            }
            let result = self
                .send_to_node(
                    source,
                    &subscriber,
                    DeviceMessageType::EventBroadcast,
                    body.clone(),
                    SendOptions::fire_and_forget(),
                )
                .await;
            if result.is_success() {
                report.success.push(subscriber);
            } else {
                report.failed.push(subscriber);
            }
        }

        let listeners = self.router.emit_event(event_type, source, data).await;
        tracing::debug!(
            event_type = %event_type,
            subscribers = report.attempted(),
            listeners,
            "event published"
        );
        report
    }

    // ── Responses ────────────────────────────────────────────────────

    /// Resolve the pending request `message_id` with `payload`. Returns
    /// false when nothing was waiting.
    pub fn send_response(&self, message_id: &str, payload: &Payload) -> bool {
        self.pending.resolve(message_id, Reply::from_payload(payload))
    }

    // ── Streams ──────────────────────────────────────────────────────

    pub fn open_stream(&self, source: &str, target: &str) -> StreamSession {
        StreamSession::new(source, target)
    }

    /// Transmit one chunk in the structured form.
    pub async fn send_stream(&self, chunk: &StreamMessage) -> SendResult {
        let message_id = chunk.header.message_id.clone();
        let text = match chunk.to_message().to_json_string() {
            Ok(t) => t,
            Err(e) => {
                return SendResult::Undelivered {
                    message_id,
                    reason: e.to_string(),
                }
            }
        };
        match self.link.send_frame(text).await {
            Ok(()) => SendResult::Delivered { message_id },
            Err(e) => SendResult::Undelivered {
                message_id,
                reason: e.to_string(),
            },
        }
    }

    /// Send a protocol message in the structured form.
    pub async fn send_message(&self, msg: &Message) -> SendResult {
        let message_id = msg.id().to_string();
        let result = match msg.to_json_string() {
            Ok(text) => self.link.send_frame(text).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => SendResult::Delivered { message_id },
            Err(reason) => SendResult::Undelivered { message_id, reason },
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────

    /// Process one device envelope received from the server.
    pub async fn handle_incoming_message(&self, device: &DeviceMessage) {
        let msg = NodeMessage::from_device(device);

        if let Some(original) = msg.payload.get(ORIGINAL_MESSAGE_ID).and_then(Value::as_str) {
            if !self.pending.resolve(original, Reply::from_payload(&msg.payload)) {
                tracing::debug!(correlation_id = %original, "no pending request for response, dropping");
            }
            return;
        }
        if let Some(cid) = device.correlation_id.as_deref() {
            if self.pending.contains(cid) {
                self.pending.resolve(cid, Reply::from_payload(&msg.payload));
                return;
            }
        }

        match msg.message_type {
            DeviceMessageType::EventBroadcast => {
                let (event_type, data) = event_parts(&msg.payload);
                self.router.emit_event(&event_type, &msg.source_id, data).await;
            }
            DeviceMessageType::NodeWakeup | DeviceMessageType::NodeActivate | DeviceMessageType::Command => {
                tracing::debug!(
                    message_id = %msg.message_id,
                    message_type = %msg.message_type,
                    source = %msg.source_id,
                    "incoming node request"
                );
                let reply = dispatch_local(&self.router, &self.node_id, &msg).await;
                self.answer(&msg, reply).await;
            }
            DeviceMessageType::Error => {
                tracing::warn!(
                    message_id = %msg.message_id,
                    source = %msg.source_id,
                    error = ?device.error,
                    "server reported an error"
                );
            }
            other => {
                tracing::debug!(message_type = %other, message_id = %msg.message_id, "unhandled device message, dropping");
            }
        }
    }

    async fn answer(&self, request: &NodeMessage, reply: Reply) {
        let kind = match request.message_type {
            DeviceMessageType::Command => DeviceMessageType::CommandResult,
            other => other,
        };
        let mut payload = reply.into_payload();
        payload.insert(ORIGINAL_MESSAGE_ID.into(), Value::String(request.message_id.clone()));

        let mut device = NodeMessage::new(kind, self.node_id.clone(), request.source_id.clone(), payload).to_device();
        device.correlation_id = Some(request.message_id.clone());

        let sent = match device.to_json_string() {
            Ok(text) => self.link.send_frame(text).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = sent {
            tracing::warn!(
                message_id = %request.message_id,
                target = %request.source_id,
                error = %e,
                "failed to send reply"
            );
        }
    }
}

fn event_parts(payload: &Payload) -> (String, Payload) {
    let event_type = payload
        .get("event_type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let data = payload
        .get("data")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    (event_type, data)
}

/// Map a node request to the action it invokes and that action's payload.
fn local_invocation(msg: &NodeMessage) -> Result<(String, Payload), Reply> {
    let str_field = |key: &str| msg.payload.get(key).and_then(Value::as_str).map(str::to_string);
    match msg.message_type {
        DeviceMessageType::NodeWakeup => Ok((DeviceMessageType::NodeWakeup.as_str().to_string(), msg.payload.clone())),
        DeviceMessageType::NodeActivate => {
            let action = str_field("action").ok_or_else(|| Reply::err("invalid_args: node_activate without action"))?;
            let params = msg
                .payload
                .get("params")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            Ok((action, params))
        }
        DeviceMessageType::Command => {
            let command = str_field("command").ok_or_else(|| Reply::err("invalid_args: command without name"))?;
            let mut args = msg.payload.clone();
            args.remove("command");
            Ok((command, args))
        }
        other => Err(Reply::err(format!("Unhandled message type for local node: {other}"))),
    }
}

async fn dispatch_local(router: &MessageRouter, node_id: &str, msg: &NodeMessage) -> Reply {
    let (action, payload) = match local_invocation(msg) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let ctx = ActionContext::new(
        msg.message_id.clone(),
        action.clone(),
        msg.source_id.clone(),
        node_id,
        router.cancel_token().child_token(),
    );
    router.invoke(&action, ctx, payload).await
}

/// In-process handler for this node: node requests go to the router's
/// action handlers and `event_broadcast` to its listeners.
pub struct LocalDispatch {
    node_id: String,
    router: Arc<MessageRouter>,
}

impl LocalDispatch {
    pub fn new(node_id: impl Into<String>, router: Arc<MessageRouter>) -> Self {
        Self {
            node_id: node_id.into(),
            router,
        }
    }
}

#[async_trait::async_trait]
impl NodeHandler for LocalDispatch {
    async fn handle(&self, msg: NodeMessage) -> Reply {
        if msg.message_type == DeviceMessageType::EventBroadcast {
            let (event_type, data) = event_parts(&msg.payload);
            let n = self.router.emit_event(&event_type, &msg.source_id, data).await;
            return Reply::ok(serde_json::json!({ "listeners": n }));
        }
        dispatch_local(&self.router, &self.node_id, &msg).await
    }
}

/// Run a local node handler. A panic becomes a failed [`Reply`].
async fn deliver_local(handler: Arc<dyn NodeHandler>, msg: NodeMessage) -> Reply {
    let message_id = msg.message_id.clone();
    let target = msg.target_id.clone();
    match AssertUnwindSafe(handler.handle(msg)).catch_unwind().await {
        Ok(reply) => reply,
        Err(_panic) => {
            tracing::error!(message_id = %message_id, target = %target, "local node handler panicked");
            Reply::err("handler panicked")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, listener_fn};
    use crate::registry::NodeIdentity;
    use crate::types::{HandlerError, TransportError};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingLink {
        frames: Mutex<Vec<String>>,
        /// Targets whose frames fail to send.
        refuse: Mutex<Vec<String>>,
    }

    impl RecordingLink {
        fn frames(&self) -> Vec<Value> {
            self.frames
                .lock()
                .iter()
                .map(|t| serde_json::from_str(t).unwrap())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl Link for RecordingLink {
        async fn send_frame(&self, text: String) -> Result<(), TransportError> {
            let v: Value = serde_json::from_str(&text).unwrap();
            let target = v["payload"]["target_id"].as_str().unwrap_or_default().to_string();
            if self.refuse.lock().contains(&target) {
                return Err(TransportError::Send("refused".into()));
            }
            self.frames.lock().push(text);
            Ok(())
        }
    }

    struct Harness {
        comm: Arc<Communicator>,
        registry: Arc<NodeRegistry>,
        router: Arc<MessageRouter>,
        link: Arc<RecordingLink>,
    }

    fn harness() -> Harness {
        let pending = Arc::new(PendingRequests::new());
        let router = Arc::new(MessageRouter::new("phone", pending));
        let registry = Arc::new(NodeRegistry::new());
        registry.register(
            NodeIdentity::new("phone", NodeKind::Android, "Phone"),
            Some(Arc::new(LocalDispatch::new("phone", router.clone()))),
        );
        let link = Arc::new(RecordingLink::default());
        let comm = Arc::new(Communicator::new(
            "phone",
            registry.clone(),
            router.clone(),
            link.clone(),
            Duration::from_secs(30),
        ));
        Harness {
            comm,
            registry,
            router,
            link,
        }
    }

    fn p(v: Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn self_targeted_send_never_touches_the_link() {
        let h = harness();
        h.router.register(
            "flashlight",
            handler_fn(|_ctx, payload| async move { Ok(json!({"on": payload["on"]})) }),
        );

        let r = h
            .comm
            .activate_self("phone", "flashlight", p(json!({"on": true})))
            .await;
        assert_eq!(r, SendResult::Replied(Reply::ok(json!({"on": true}))));

        let r = h
            .comm
            .send_to_node(
                "phone",
                "self",
                DeviceMessageType::NodeActivate,
                p(json!({"action": "flashlight", "params": {"on": false}})),
                SendOptions::wait(),
            )
            .await;
        assert!(r.is_success());
        assert!(h.link.frames().is_empty());
    }

    #[tokio::test]
    async fn missing_local_handler_is_a_failed_reply() {
        let h = harness();
        let r = h.comm.activate_self("phone", "teleport", Payload::new()).await;
        assert_eq!(r.reply().and_then(|r| r.error.as_deref()), Some("Handler not found: teleport"));
    }

    #[tokio::test]
    async fn fire_and_forget_remote_send_is_delivered() {
        let h = harness();
        h.registry.register(NodeIdentity::new("tablet", NodeKind::Android, "Tablet"), None);
        let r = h
            .comm
            .send_to_node(
                "phone",
                "tablet",
                DeviceMessageType::CoordSync,
                p(json!({"k": 1})),
                SendOptions::fire_and_forget(),
            )
            .await;
        let SendResult::Delivered { message_id } = r else {
            panic!("expected Delivered, got {r:?}");
        };

        let frames = h.link.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "coord_sync");
        assert_eq!(frames[0]["message_id"], message_id.as_str());
        assert_eq!(frames[0]["payload"]["target_id"], "tablet");
        assert_eq!(frames[0]["payload"]["k"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_and_leaves_no_pending_entry() {
        let h = harness();
        let r = h
            .comm
            .send_to_node(
                "phone",
                "server",
                DeviceMessageType::TaskStatus,
                Payload::new(),
                SendOptions::wait().with_timeout(Duration::from_millis(100)),
            )
            .await;
        assert!(r.is_timeout());
        assert!(!r.is_success());
        assert!(h.router.pending().is_empty());
        assert_eq!(h.link.frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn incoming_original_message_id_resolves_the_wait() {
        let h = harness();
        let comm = h.comm.clone();
        let task = tokio::spawn(async move {
            comm.wakeup_node("phone", "watch", "alarm", Payload::new()).await
        });

        // Wait for the request to go out.
        let request = loop {
            if let Some(f) = h.link.frames().pop() {
                break f;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(request["type"], "node_wakeup");
        assert_eq!(request["payload"]["reason"], "alarm");

        let mut reply = DeviceMessage::new(DeviceMessageType::NodeWakeup, "watch");
        reply.payload = p(json!({
            "original_message_id": request["message_id"],
            "success": true,
            "data": {"status": "awake"}
        }));
        h.comm.handle_incoming_message(&reply).await;

        let r = task.await.unwrap();
        assert_eq!(r, SendResult::Replied(Reply::ok(json!({"status": "awake"}))));
        assert!(h.router.pending().is_empty());
    }

    #[tokio::test]
    async fn unavailable_link_is_undelivered() {
        let h = harness();
        h.link.refuse.lock().push("server".into());
        let r = h
            .comm
            .send_to_node("phone", "server", DeviceMessageType::Command, Payload::new(), SendOptions::wait())
            .await;
        assert!(matches!(r, SendResult::Undelivered { .. }));
        assert!(h.router.pending().is_empty());
    }

    #[tokio::test]
    async fn broadcast_records_each_failure_without_aborting() {
        let h = harness();
        for id in ["a", "b", "c", "d", "e"] {
            h.registry.register(NodeIdentity::new(id, NodeKind::Desktop, id), None);
        }
        h.link.refuse.lock().extend(["b".to_string(), "d".to_string()]);

        let report = h
            .comm
            .broadcast("phone", DeviceMessageType::CoordBroadcast, Payload::new(), None)
            .await;
        assert_eq!(report.success, vec!["a", "c", "e"]);
        assert_eq!(report.failed, vec!["b", "d"]);
        assert_eq!(report.attempted(), 5);
        assert!(!report.success.contains(&"phone".to_string()));
    }

    struct Exploding;

    #[async_trait::async_trait]
    impl NodeHandler for Exploding {
        async fn handle(&self, _message: NodeMessage) -> Reply {
            panic!("local node blew up");
        }
    }

    #[tokio::test]
    async fn panicking_local_node_fails_alone() {
        let h = harness();
        h.registry.register(NodeIdentity::new("a", NodeKind::Desktop, "A"), Some(Arc::new(Exploding)));
        h.registry.register(NodeIdentity::new("b", NodeKind::Desktop, "B"), None);

        let report = h
            .comm
            .broadcast("phone", DeviceMessageType::CoordBroadcast, Payload::new(), None)
            .await;
        assert_eq!(report.failed, vec!["a"]);
        assert_eq!(report.success, vec!["b"]);
        assert_eq!(h.link.frames()[0]["payload"]["target_id"], "b");

        let r = h
            .comm
            .send_to_node("phone", "a", DeviceMessageType::Command, Payload::new(), SendOptions::wait())
            .await;
        assert_eq!(r, SendResult::Replied(Reply::err("handler panicked")));
    }

    #[tokio::test]
    async fn broadcast_filters_by_kind_and_wildcard_target_broadcasts() {
        let h = harness();
        h.registry.register(NodeIdentity::new("mac", NodeKind::Desktop, "Mac"), None);
        h.registry.register(NodeIdentity::new("pixel", NodeKind::Android, "Pixel"), None);

        let report = h
            .comm
            .broadcast("phone", DeviceMessageType::CoordSync, Payload::new(), Some(&[NodeKind::Android]))
            .await;
        assert_eq!(report.success, vec!["pixel"]);

        let r = h
            .comm
            .send_to_node("phone", "*", DeviceMessageType::CoordSync, Payload::new(), SendOptions::default())
            .await;
        let SendResult::Broadcast(report) = r else {
            panic!("expected Broadcast, got {r:?}");
        };
        assert_eq!(report.success, vec!["mac", "pixel"]);
    }

    #[tokio::test]
    async fn publish_reaches_exactly_the_subscribers() {
        let h = harness();
        for id in ["s1", "s2", "s3", "bystander"] {
            h.registry.register(NodeIdentity::new(id, NodeKind::Web, id), None);
        }
        for id in ["s1", "s2", "s3"] {
            h.registry.subscribe(id, "battery_low").unwrap();
        }

        let local = Arc::new(AtomicUsize::new(0));
        let seen = local.clone();
        h.comm.on_event(
            "battery_low",
            listener_fn(move |event| {
                let seen = seen.clone();
                async move {
                    assert_eq!(event.data["level"], 5);
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let report = h
            .comm
            .publish_event("phone", "battery_low", p(json!({"level": 5})))
            .await;
        assert_eq!(report.success, vec!["s1", "s2", "s3"]);

        let frames = h.link.frames();
        let targets: Vec<&str> = frames.iter().map(|f| f["payload"]["target_id"].as_str().unwrap()).collect();
        assert_eq!(targets, vec!["s1", "s2", "s3"]);
        assert!(frames.iter().all(|f| f["type"] == "event_broadcast"));
        assert_eq!(frames[0]["payload"]["event_type"], "battery_low");
        assert_eq!(frames[0]["payload"]["data"]["level"], 5);
        assert_eq!(local.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn self_subscription_runs_listeners_once() {
        let h = harness();
        h.registry.subscribe("phone", "tick").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        h.comm.on_event(
            "tick",
            listener_fn(move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        let report = h.comm.publish_event("phone", "tick", Payload::new()).await;
        assert_eq!(report.success, vec!["phone"]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(h.link.frames().is_empty());
    }

    #[tokio::test]
    async fn incoming_command_is_answered_with_command_result() {
        let h = harness();
        h.router.register(
            "sum",
            handler_fn(|_ctx, payload| async move {
                let args = payload["args"].as_array().cloned().unwrap_or_default();
                let total: i64 = args.iter().filter_map(Value::as_i64).sum();
                Ok(json!(total))
            }),
        );

        let mut cmd = DeviceMessage::new(DeviceMessageType::Command, "server");
        cmd.payload = p(json!({"command": "sum", "args": [1, 2, 3], "kwargs": {}}));
        h.comm.handle_incoming_message(&cmd).await;

        let frames = h.link.frames();
        assert_eq!(frames.len(), 1);
        let out = &frames[0];
        assert_eq!(out["type"], "command_result");
        assert_eq!(out["device_id"], "phone");
        assert_eq!(out["correlation_id"], cmd.message_id.as_str());
        assert_eq!(out["payload"]["original_message_id"], cmd.message_id.as_str());
        assert_eq!(out["payload"]["target_id"], "server");
        assert_eq!(out["payload"]["success"], true);
        assert_eq!(out["payload"]["data"], 6);
    }

    #[tokio::test]
    async fn incoming_command_failure_is_reported() {
        let h = harness();
        h.router.register(
            "reboot",
            handler_fn(|_ctx, _payload| async move { Err(HandlerError::NotAllowed("locked".into())) }),
        );
        let mut cmd = DeviceMessage::new(DeviceMessageType::Command, "server");
        cmd.payload = p(json!({"command": "reboot"}));
        h.comm.handle_incoming_message(&cmd).await;

        let out = &h.link.frames()[0];
        assert_eq!(out["payload"]["success"], false);
        assert_eq!(out["payload"]["error"], "not_allowed: locked");
    }

    #[tokio::test]
    async fn incoming_event_broadcast_reaches_listeners() {
        let h = harness();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        h.router.add_listener(
            "screen_on",
            listener_fn(move |event| {
                let c = c.clone();
                async move {
                    assert_eq!(event.source, "server");
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        let mut ev = DeviceMessage::new(DeviceMessageType::EventBroadcast, "server");
        ev.payload = p(json!({"event_type": "screen_on", "data": {}}));
        h.comm.handle_incoming_message(&ev).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(h.link.frames().is_empty());
    }

    #[tokio::test]
    async fn send_response_resolves_once() {
        let h = harness();
        let waiter = h.router.pending().register("m-1", Duration::from_secs(5));
        assert!(h.comm.send_response("m-1", &p(json!({"success": true, "data": 1}))));
        assert!(!h.comm.send_response("m-1", &p(json!({"success": true, "data": 2}))));
        assert_eq!(waiter.wait().await, WaitOutcome::Reply(Reply::ok(json!(1))));
    }
}
