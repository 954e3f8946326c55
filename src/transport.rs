//! Broker transport abstraction
//!
//! The session talks to the broker through these traits so the connection
//! lifecycle can be driven by an in-memory fake in tests. The real
//! implementation wraps a tokio-tungstenite WebSocket.

use crate::error::{AgentError, Result};
use crate::protocol::{encode_frame, parse_frame, Frame};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

/// One open full-duplex connection to the broker
#[async_trait]
pub trait Transport: Send {
    /// Send a frame; failure means the socket is gone
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Next inbound frame. `Ok(None)` means the peer closed the connection.
    /// Unparseable frames are logged and skipped, not surfaced.
    async fn recv(&mut self) -> Result<Option<Frame>>;

    /// Close the connection deliberately (best effort)
    async fn close(&mut self);
}

/// Opens a fresh transport for each connection attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Transport>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport over tokio-tungstenite
pub struct WsTransport {
    ws: WsStream,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let text = encode_frame(&frame)?;
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => match parse_frame(text.as_str()) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => {
                        // Drop the frame, keep the connection open
                        warn!("dropping unparseable frame: {}", e);
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    self.ws
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| AgentError::Transport(e.to_string()))?;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "broker closed connection");
                    return Ok(None);
                }
                Some(Ok(_)) => {} // Ignore binary and pong frames
                Some(Err(e)) => return Err(AgentError::Transport(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Connector dialing the broker's WebSocket endpoint
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(AgentError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }
        Ok(Self { url })
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self) -> Result<Box<dyn Transport>> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        debug!(url = %self.url, "websocket open");
        Ok(Box::new(WsTransport { ws }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_connector_accepts_ws_schemes() {
        assert!(WsConnector::new("ws://broker.local/connect").is_ok());
        assert!(WsConnector::new("wss://broker.local/connect").is_ok());
    }

    #[test]
    fn test_ws_connector_rejects_http() {
        let result = WsConnector::new("https://broker.local/connect");
        assert!(matches!(result, Err(AgentError::InvalidUrl(_))));
    }
}
