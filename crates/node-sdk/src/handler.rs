//! Handler traits invoked by the router and the registry.

use std::future::Future;
use std::marker::PhantomData;

use gx_protocol::{NodeMessage, Payload, Reply, StreamError, StreamMessage};
use tokio_util::sync::CancellationToken;

use crate::types::{HandlerError, HandlerResult};

/// Context provided to every action handler invocation.
#[derive(Clone, Debug)]
pub struct ActionContext {
    /// Id of the message that triggered the call. Responses correlate on it.
    pub message_id: String,
    pub action: String,
    pub source: String,
    pub target: String,
    /// Cancelled when the runtime shuts down.
    pub cancel: CancellationToken,
}

impl ActionContext {
    pub fn new(
        message_id: impl Into<String>,
        action: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            action: action.into(),
            source: source.into(),
            target: target.into(),
            cancel,
        }
    }
}

/// Implement this trait to handle requests for an action.
///
/// Handlers run concurrently on the Tokio runtime, possibly several times at
/// once for different messages, and must not assume exclusive access to any
/// shared state.
///
/// # Example
///
/// ```rust,no_run
/// use gx_node_sdk::{ActionContext, ActionHandler, HandlerResult};
/// use gx_node_sdk::Payload;
///
/// struct Ping;
///
/// #[async_trait::async_trait]
/// impl ActionHandler for Ping {
///     async fn call(&self, _ctx: ActionContext, _payload: Payload) -> HandlerResult {
///         Ok(serde_json::json!({ "pong": true }))
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    async fn call(&self, ctx: ActionContext, payload: Payload) -> HandlerResult;
}

/// Adapter turning an async closure into an [`ActionHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(ActionContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait::async_trait]
impl<F, Fut> ActionHandler for FnHandler<F, Fut>
where
    F: Fn(ActionContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, ctx: ActionContext, payload: Payload) -> HandlerResult {
        (self.f)(ctx, payload).await
    }
}

// ── Events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub source: String,
    pub data: Payload,
}

#[async_trait::async_trait]
pub trait EventListener: Send + Sync + 'static {
    async fn on_event(&self, event: Event) -> Result<(), HandlerError>;
}

pub struct FnListener<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

pub fn listener_fn<F, Fut>(f: F) -> FnListener<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnListener {
        f,
        _fut: PhantomData,
    }
}

#[async_trait::async_trait]
impl<F, Fut> EventListener for FnListener<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn on_event(&self, event: Event) -> Result<(), HandlerError> {
        (self.f)(event).await
    }
}

// ── Streams ──────────────────────────────────────────────────────────

/// Receives validated chunks of incoming streams.
#[async_trait::async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Called for each accepted chunk, start and end included.
    async fn on_chunk(&self, chunk: StreamMessage) -> Result<(), HandlerError>;

    /// Called when a stream violates sequencing. The stream is dropped.
    async fn on_error(&self, error: StreamError) {
        tracing::warn!(error = %error, "stream aborted");
    }
}

// ── Local nodes ──────────────────────────────────────────────────────

/// In-process delivery target for a node registered with a local handler.
#[async_trait::async_trait]
pub trait NodeHandler: Send + Sync + 'static {
    async fn handle(&self, message: NodeMessage) -> Reply;
}
