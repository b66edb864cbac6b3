//! Node runtime: owns the registry, router, connection and communicator of
//! one node and runs the inbound dispatcher.
//!
//! Built with [`NodeRuntimeBuilder`](crate::NodeRuntimeBuilder).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gx_protocol::{check_frame_size, decode_frame, Frame, Message, MessageType, StreamMessage};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::communicator::Communicator;
use crate::connection::{ConnectionManager, ConnectionState, Link};
use crate::pending::PendingRequests;
use crate::registry::NodeRegistry;
use crate::router::MessageRouter;
use crate::types::RuntimeError;

const STREAM_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

pub struct NodeRuntime {
    pub(crate) node_id: String,
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) router: Arc<MessageRouter>,
    pub(crate) pending: Arc<PendingRequests>,
    pub(crate) connection: Arc<ConnectionManager>,
    pub(crate) communicator: Arc<Communicator>,
    pub(crate) max_concurrent_handlers: usize,
    pub(crate) max_frame_bytes: usize,
    pub(crate) stream_idle_timeout: Duration,
    pub(crate) shutdown: CancellationToken,
    pub(crate) inbound: Mutex<Option<mpsc::Receiver<String>>>,
    pub(crate) dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl NodeRuntime {
    pub fn builder() -> crate::builder::NodeRuntimeBuilder {
        crate::builder::NodeRuntimeBuilder::new()
    }

    /// Spawn the dispatcher and connect. Returns once the first connection
    /// attempt has opened or failed; after a failure the runtime keeps
    /// reconnecting in the background.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        if self.shutdown.is_cancelled() {
            return Err(RuntimeError::Shutdown);
        }
        let rx = self.inbound.lock().take().ok_or(RuntimeError::AlreadyStarted)?;

        let dispatch = Dispatch {
            registry: self.registry.clone(),
            router: self.router.clone(),
            communicator: self.communicator.clone(),
            link: self.connection.clone(),
            max_frame_bytes: self.max_frame_bytes,
            stream_idle_timeout: self.stream_idle_timeout,
        };
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_handlers));
        let handle = tokio::spawn(dispatch.run(rx, semaphore, self.shutdown.clone()));
        *self.dispatcher.lock() = Some(handle);

        tracing::info!(
            node_id = %self.node_id,
            url = %self.connection.config().url,
            actions = ?self.router.actions(),
            "node runtime starting"
        );
        self.connection.connect().await?;
        Ok(())
    }

    /// Disconnect, stop the dispatcher, then fail every pending request.
    pub async fn shutdown(&self) {
        self.connection.disconnect();
        self.shutdown.cancel();
        self.router.cancel_token().cancel();

        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "dispatcher task ended abnormally");
            }
        }

        let failed = self.pending.fail_all("runtime shut down");
        tracing::info!(node_id = %self.node_id, failed_requests = failed, "node runtime stopped");
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn communicator(&self) -> &Arc<Communicator> {
        &self.communicator
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────

#[derive(Clone)]
struct Dispatch {
    registry: Arc<NodeRegistry>,
    router: Arc<MessageRouter>,
    communicator: Arc<Communicator>,
    link: Arc<ConnectionManager>,
    max_frame_bytes: usize,
    stream_idle_timeout: Duration,
}

impl Dispatch {
    async fn run(self, mut rx: mpsc::Receiver<String>, semaphore: Arc<Semaphore>, shutdown: CancellationToken) {
        let mut lanes = StreamLanes::default();
        let mut sweep = tokio::time::interval(STREAM_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let text = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    self.router.evict_idle_streams();
                    lanes.sweep(self.stream_idle_timeout);
                    continue;
                }
                next = rx.recv() => match next {
                    Some(text) => text,
                    None => break,
                },
            };
            let Some(frame) = self.decode(&text) else {
                continue;
            };

            // Chunks of one stream keep their transport order.
            if let Some((stream_id, is_end)) = stream_key(&frame) {
                lanes.push(&self, &semaphore, stream_id, is_end, frame);
                continue;
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let dispatch = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                dispatch.handle_frame(frame).await;
            });
        }
        tracing::debug!(open_lanes = lanes.len(), "dispatcher stopped");
    }

    fn decode(&self, text: &str) -> Option<Frame> {
        if let Err(e) = check_frame_size(text, self.max_frame_bytes) {
            tracing::warn!(error = %e, "dropping inbound frame");
            return None;
        }
        match decode_frame(text) {
            Ok(f) => Some(f),
            Err(e) => {
                tracing::warn!(error = %e, bytes = text.len(), "dropping undecodable frame");
                None
            }
        }
    }

    async fn handle_frame(&self, frame: Frame) {
        match &frame {
            Frame::Device(device) => self.communicator.handle_incoming_message(device).await,
            Frame::Protocol(msg) | Frame::Simple(msg) => match msg.message_type() {
                MessageType::Subscribe | MessageType::Unsubscribe => self.apply_subscription(msg),
                _ => {
                    if let Some(reply) = self.router.route(msg).await {
                        self.send_reply(&frame, &reply).await;
                    }
                }
            },
        }
    }

    async fn send_reply(&self, frame: &Frame, reply: &Message) {
        let text = match frame.encode_reply(reply) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(message_id = %reply.id(), error = %e, "failed to encode reply");
                return;
            }
        };
        if let Err(e) = self.link.send_frame(text).await {
            tracing::warn!(
                message_id = %reply.id(),
                correlation_id = ?reply.header.correlation_id,
                error = %e,
                "failed to send reply"
            );
        }
    }

    /// `subscribe` / `unsubscribe` from a peer: the event types come from
    /// `payload.event_types`, `payload.event_type`, or the action.
    fn apply_subscription(&self, msg: &Message) {
        let node_id = msg.header.source_node.as_str();
        let mut event_types: Vec<String> = msg
            .payload
            .get("event_types")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        if event_types.is_empty() {
            if let Some(t) = msg.payload.get("event_type").and_then(Value::as_str) {
                event_types.push(t.to_string());
            } else if !msg.action.is_empty() {
                event_types.push(msg.action.clone());
            }
        }
        if event_types.is_empty() {
            tracing::warn!(node_id = %node_id, message_id = %msg.id(), "subscription without event type, dropping");
            return;
        }

        let subscribe = msg.message_type() == MessageType::Subscribe;
        for event_type in &event_types {
            if subscribe {
                if let Err(e) = self.registry.subscribe(node_id, event_type) {
                    tracing::warn!(event_type = %event_type, error = %e, "subscribe rejected");
                }
            } else {
                self.registry.unsubscribe(node_id, event_type);
            }
        }
    }
}

// ── Stream lanes ─────────────────────────────────────────────────────

/// Stream id and whether the frame closes the stream, for stream frames.
fn stream_key(frame: &Frame) -> Option<(String, bool)> {
    let msg = match frame {
        Frame::Protocol(msg) | Frame::Simple(msg) => msg,
        Frame::Device(_) => return None,
    };
    let is_end = match msg.message_type() {
        MessageType::StreamStart | MessageType::StreamData => false,
        MessageType::StreamEnd => true,
        _ => return None,
    };
    // Malformed chunks carry no stream id; the router reports them.
    let chunk = StreamMessage::from_message(msg).ok()?;
    Some((chunk.stream_id, is_end))
}

struct Lane {
    tx: mpsc::UnboundedSender<Frame>,
    last_used: Instant,
}

/// One sequential worker per open stream.
#[derive(Default)]
struct StreamLanes {
    lanes: HashMap<String, Lane>,
}

impl StreamLanes {
    fn push(&mut self, dispatch: &Dispatch, semaphore: &Arc<Semaphore>, stream_id: String, is_end: bool, frame: Frame) {
        let now = Instant::now();
        let unsent = match self.lanes.get_mut(&stream_id) {
            Some(lane) => {
                lane.last_used = now;
                lane.tx.send(frame).err().map(|mpsc::error::SendError(f)| f)
            }
            None => Some(frame),
        };
        if let Some(frame) = unsent {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(frame);
            tokio::spawn(dispatch.clone().run_lane(rx, semaphore.clone()));
            self.lanes.insert(stream_id.clone(), Lane { tx, last_used: now });
        }
        if is_end {
            // Dropping the sender lets the worker drain and exit.
            self.lanes.remove(&stream_id);
        }
    }

    fn sweep(&mut self, idle: Duration) {
        let now = Instant::now();
        self.lanes
            .retain(|_, lane| !lane.tx.is_closed() && now.duration_since(lane.last_used) < idle);
    }

    fn len(&self) -> usize {
        self.lanes.len()
    }
}

impl Dispatch {
    async fn run_lane(self, mut rx: mpsc::UnboundedReceiver<Frame>, semaphore: Arc<Semaphore>) {
        while let Some(frame) = rx.recv().await {
            let Ok(_permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            self.handle_frame(frame).await;
        }
    }
}
