//! Message router: dispatches protocol messages by type.
//!
//! - `request`      → action handler, always answered with a `response`
//! - `response`     → pending-request resolution by `correlation_id`
//! - `event`        → every listener for the event type
//! - `ping`         → `pong`
//! - `stream_*`     → per-stream sequencing check, then the stream handler
//!
//! Anything else is logged and dropped. The router never fails: handler
//! errors, panics and missing handlers all become responses.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use gx_protocol::{Message, MessageType, Payload, Reply, StreamError, StreamMessage, StreamReceiver};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::handler::{ActionContext, ActionHandler, Event, EventListener, StreamHandler};
use crate::pending::PendingRequests;

/// How long an open stream may go without a chunk before it is dropped.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct OpenStream {
    receiver: StreamReceiver,
    last_seen: Instant,
}

pub struct MessageRouter {
    node_id: String,
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
    listeners: RwLock<HashMap<String, Vec<Arc<dyn EventListener>>>>,
    stream_handler: RwLock<Option<Arc<dyn StreamHandler>>>,
    streams: Mutex<HashMap<String, OpenStream>>,
    stream_idle_timeout: Duration,
    pending: Arc<PendingRequests>,
    cancel: CancellationToken,
}

impl MessageRouter {
    pub fn new(node_id: impl Into<String>, pending: Arc<PendingRequests>) -> Self {
        Self {
            node_id: node_id.into(),
            handlers: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            stream_handler: RwLock::new(None),
            streams: Mutex::new(HashMap::new()),
            stream_idle_timeout: STREAM_IDLE_TIMEOUT,
            pending,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Register the handler for `action`, replacing any previous one.
    pub fn register<H: ActionHandler>(&self, action: impl Into<String>, handler: H) {
        self.register_arc(action, Arc::new(handler));
    }

    pub fn register_arc(&self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let action = action.into();
        if self.handlers.write().insert(action.clone(), handler).is_some() {
            tracing::debug!(action = %action, "replaced action handler");
        }
    }

    pub fn unregister(&self, action: &str) -> bool {
        self.handlers.write().remove(action).is_some()
    }

    pub fn has_handler(&self, action: &str) -> bool {
        self.handlers.read().contains_key(action)
    }

    /// Registered action names (sorted).
    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn add_listener<L: EventListener>(&self, event_type: impl Into<String>, listener: L) {
        self.add_listener_arc(event_type, Arc::new(listener));
    }

    pub fn add_listener_arc(&self, event_type: impl Into<String>, listener: Arc<dyn EventListener>) {
        self.listeners
            .write()
            .entry(event_type.into())
            .or_default()
            .push(listener);
    }

    pub fn set_stream_handler<S: StreamHandler>(&self, handler: S) {
        self.set_stream_handler_arc(Arc::new(handler));
    }

    pub fn set_stream_handler_arc(&self, handler: Arc<dyn StreamHandler>) {
        *self.stream_handler.write() = Some(handler);
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    /// Parent token of every [`ActionContext::cancel`].
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn open_streams(&self) -> usize {
        self.streams.lock().len()
    }

    /// Drop streams that have not seen a chunk within the idle timeout.
    /// Returns how many were dropped.
    pub fn evict_idle_streams(&self) -> usize {
        let now = Instant::now();
        let idle = self.stream_idle_timeout;
        let mut streams = self.streams.lock();
        let before = streams.len();
        streams.retain(|stream_id, open| {
            let keep = now.duration_since(open.last_seen) < idle;
            if !keep {
                tracing::warn!(stream_id = %stream_id, idle_secs = idle.as_secs(), "dropping idle stream");
            }
            keep
        });
        before - streams.len()
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Route one inbound message. Returns the message to send back, if any.
    pub async fn route(&self, msg: &Message) -> Option<Message> {
        match msg.message_type() {
            MessageType::Request => Some(self.handle_request(msg).await),
            MessageType::Response => {
                self.handle_response(msg);
                None
            }
            MessageType::Event => {
                self.emit_event(msg.event_type(), &msg.header.source_node, msg.payload.clone())
                    .await;
                None
            }
            MessageType::Ping => {
                let mut pong = Message::pong_to(msg);
                if pong.header.source_node.is_empty() {
                    pong.header.source_node = self.node_id.clone();
                }
                Some(pong)
            }
            MessageType::Pong => {
                tracing::trace!(message_id = %msg.id(), "received pong");
                None
            }
            MessageType::StreamStart | MessageType::StreamData | MessageType::StreamEnd => {
                self.handle_stream(msg).await;
                None
            }
            other => {
                tracing::debug!(
                    message_type = %other,
                    message_id = %msg.id(),
                    "no route for message type, dropping"
                );
                None
            }
        }
    }

    async fn handle_request(&self, req: &Message) -> Message {
        tracing::debug!(
            message_id = %req.id(),
            action = %req.action,
            source = %req.header.source_node,
            "received request"
        );
        let ctx = ActionContext::new(
            req.header.message_id.clone(),
            req.action.clone(),
            req.header.source_node.clone(),
            req.header.target_node.clone(),
            self.cancel.child_token(),
        );
        let reply = self.invoke(&req.action, ctx, req.payload.clone()).await;

        let mut resp = Message::response_to(req, reply);
        if resp.header.source_node.is_empty() {
            resp.header.source_node = self.node_id.clone();
        }
        resp
    }

    fn handle_response(&self, resp: &Message) {
        match resp.header.correlation_id.as_deref() {
            Some(cid) => {
                self.pending.resolve(cid, Reply::from_payload(&resp.payload));
            }
            None => {
                tracing::debug!(message_id = %resp.id(), "response without correlation_id, dropping");
            }
        }
    }

    /// Invoke the handler for `action`. Errors, panics and a missing
    /// handler are all folded into a failed [`Reply`].
    pub async fn invoke(&self, action: &str, ctx: ActionContext, payload: Payload) -> Reply {
        let handler = self.handlers.read().get(action).cloned();
        let Some(handler) = handler else {
            tracing::warn!(action = %action, "no handler registered for action");
            return Reply::err(format!("Handler not found: {action}"));
        };

        let message_id = ctx.message_id.clone();
        match AssertUnwindSafe(handler.call(ctx, payload)).catch_unwind().await {
            Ok(Ok(data)) => Reply::ok(data),
            Ok(Err(e)) => {
                tracing::debug!(action = %action, message_id = %message_id, error = %e, "handler failed");
                Reply::err(e.to_string())
            }
            Err(_panic) => {
                tracing::error!(action = %action, message_id = %message_id, "action handler panicked");
                Reply::err("handler panicked")
            }
        }
    }

    /// Deliver an event to every listener registered for `event_type`.
    /// Returns how many listeners ran to completion without error.
    pub async fn emit_event(&self, event_type: &str, source: &str, data: Payload) -> usize {
        let listeners = self.listeners.read().get(event_type).cloned().unwrap_or_default();
        if listeners.is_empty() {
            tracing::trace!(event_type = %event_type, "no listeners for event");
            return 0;
        }

        let mut ok = 0;
        for listener in listeners {
            let event = Event {
                event_type: event_type.to_string(),
                source: source.to_string(),
                data: data.clone(),
            };
            match AssertUnwindSafe(listener.on_event(event)).catch_unwind().await {
                Ok(Ok(())) => ok += 1,
                Ok(Err(e)) => {
                    tracing::warn!(event_type = %event_type, error = %e, "event listener failed");
                }
                Err(_panic) => {
                    tracing::error!(event_type = %event_type, "event listener panicked");
                }
            }
        }
        ok
    }

    async fn handle_stream(&self, msg: &Message) {
        let chunk = match StreamMessage::from_message(msg) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(message_id = %msg.id(), error = %e, "dropping malformed stream message");
                self.stream_failed(e).await;
                return;
            }
        };

        self.evict_idle_streams();
        let accepted = {
            let mut streams = self.streams.lock();
            let open = streams.entry(chunk.stream_id.clone()).or_insert_with(|| OpenStream {
                receiver: StreamReceiver::new(chunk.stream_id.clone()),
                last_seen: Instant::now(),
            });
            open.last_seen = Instant::now();
            let result = open.receiver.accept(&chunk);
            if result.is_err() || open.receiver.is_ended() {
                streams.remove(&chunk.stream_id);
            }
            result
        };

        match accepted {
            Ok(()) => {
                let handler = self.stream_handler.read().clone();
                match handler {
                    Some(h) => {
                        let stream_id = chunk.stream_id.clone();
                        if let Err(e) = h.on_chunk(chunk).await {
                            tracing::warn!(stream_id = %stream_id, error = %e, "stream handler failed");
                        }
                    }
                    None => {
                        tracing::debug!(stream_id = %chunk.stream_id, "no stream handler, dropping chunk");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(stream_id = %chunk.stream_id, error = %e, "stream sequencing violation");
                self.stream_failed(e).await;
            }
        }
    }

    async fn stream_failed(&self, error: StreamError) {
        let handler = self.stream_handler.read().clone();
        if let Some(h) = handler {
            h.on_error(error).await;
        }
    }
}
