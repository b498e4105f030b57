// Socket transport abstraction: a text-message pipe to the backend
//
// The connection manager only sees `Transport`/`TransportLink`; the
// production implementation is a WebSocket (tokio-tungstenite).

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Transport-level failures; all of them lead to the same reconnect path
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Closed by peer: {0}")]
    Closed(String),

    #[error("No traffic for {0:?}")]
    IdleTimeout(Duration),

    #[error("Server error frame: {0}")]
    ServerError(String),
}

/// Opens links to the backend
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn TransportLink>, TransportError>;
}

/// One open, bidirectional text link
#[async_trait]
pub trait TransportLink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound text message; `None` once the peer has closed.
    ///
    /// Must be cancel-safe: the manager polls it inside `select!`.
    async fn recv_text(&mut self) -> Option<Result<String, TransportError>>;

    /// Best-effort graceful close
    async fn close(&mut self);
}

/// WebSocket transport over tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn TransportLink>, TransportError> {
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        tracing::debug!("WebSocket open to {} (HTTP {})", url, response.status());
        Ok(Box::new(WebSocketLink { stream }))
    }
}

pub struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportLink for WebSocketLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(
                        String::from_utf8(bytes)
                            .map_err(|e| TransportError::ReceiveFailed(e.to_string())),
                    );
                }
                Ok(Message::Close(frame)) => {
                    tracing::debug!("WebSocket close frame: {:?}", frame);
                    return None;
                }
                // Ping/pong are answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::ReceiveFailed(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed("User disconnected"),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            tracing::debug!("WebSocket close: {}", e);
        }
    }
}
