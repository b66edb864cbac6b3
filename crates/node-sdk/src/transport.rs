//! Transport seam: one duplex text connection exposed as a pair of
//! channels.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsFrame;

use crate::types::TransportError;

/// What the transport reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    /// Orderly close, with the peer's reason if one was given.
    Closed(Option<String>),
    Failed(String),
}

/// A live connection. Dropping every `outbound` sender closes it.
pub struct TransportChannels {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<TransportChannels, TransportError>;
}

/// WebSocket connector on `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
    buffer: usize,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            buffer: 64,
        }
    }
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..Self::default()
        }
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<TransportChannels, TransportError> {
        let (ws, _response) = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| {
                TransportError::Connect(format!(
                    "timed out after {}s",
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(self.buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(self.buffer);

        // Writer task: drains outbound frames; closes the socket once every
        // sender is gone.
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = sink.send(WsFrame::Text(text)).await {
                    tracing::debug!(error = %e, "websocket write failed");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        // Reader task.
        tokio::spawn(async move {
            let event = loop {
                match stream.next().await {
                    Some(Ok(WsFrame::Text(text))) => {
                        if inbound_tx.send(TransportEvent::Frame(text)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsFrame::Binary(bytes))) => {
                        tracing::debug!(bytes = bytes.len(), "dropping binary frame");
                    }
                    Some(Ok(WsFrame::Close(frame))) => {
                        break TransportEvent::Closed(frame.map(|f| f.reason.to_string()));
                    }
                    Some(Ok(_)) => {} // ping/pong are answered by tungstenite
                    Some(Err(e)) => break TransportEvent::Failed(e.to_string()),
                    None => break TransportEvent::Closed(None),
                }
            };
            let _ = inbound_tx.send(event).await;
        });

        Ok(TransportChannels {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
