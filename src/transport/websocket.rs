//! WebSocket transport over tokio-tungstenite.

use super::{Connector, Transport, TransportEvent};
use crate::codec::WireMessage;
use crate::error::GatewayError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Longest wait for the peer to answer a close frame.
pub const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens TLS or plain WebSocket connections.
#[derive(Debug, Clone, Copy)]
pub struct WebSocketConnector {
    close_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(CLOSE_HANDSHAKE_TIMEOUT)
    }
}

impl WebSocketConnector {
    pub fn new(close_timeout: Duration) -> Self {
        Self { close_timeout }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, GatewayError> {
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|source| GatewayError::Connect {
                url: url.to_string(),
                source: Box::new(source),
            })?;

        debug!(status = %response.status(), "WebSocket handshake complete");

        Ok(Box::new(WebSocketTransport {
            stream,
            closed: false,
            close_timeout: self.close_timeout,
        }))
    }
}

/// A connected WebSocket.
pub struct WebSocketTransport {
    stream: Stream,
    closed: bool,
    close_timeout: Duration,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: WireMessage) -> Result<(), GatewayError> {
        let message = match message {
            WireMessage::Text(text) => Message::Text(text),
            WireMessage::Binary(bytes) => Message::Binary(bytes),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| GatewayError::Transport {
                message: e.to_string(),
            })
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Message(WireMessage::Text(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return TransportEvent::Message(WireMessage::Binary(bytes))
                }
                Some(Ok(Message::Close(frame))) => {
                    self.closed = true;
                    return match frame {
                        Some(frame) => TransportEvent::Closed {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.into_owned(),
                        },
                        None => TransportEvent::Closed {
                            code: None,
                            reason: String::new(),
                        },
                    };
                }
                Some(Ok(other)) => {
                    // Ping/Pong are answered by tungstenite itself
                    trace!(?other, "Ignoring control frame");
                }
                Some(Err(e)) => {
                    self.closed = true;
                    return TransportEvent::Error(e.to_string());
                }
                None => {
                    self.closed = true;
                    return TransportEvent::Closed {
                        code: None,
                        reason: "connection dropped".to_string(),
                    };
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), GatewayError> {
        if self.closed {
            return Ok(());
        }

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        };
        let stream = &mut self.stream;
        let handshake = async move {
            let result = stream.close(Some(frame)).await;
            // Drain until the peer's close frame or the end of the stream
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            result
        };
        let outcome = tokio::time::timeout(self.close_timeout, handshake).await;
        self.closed = true;

        match outcome {
            Ok(result) => result.map_err(|e| GatewayError::Transport {
                message: e.to_string(),
            }),
            Err(_) => {
                warn!(
                    timeout_ms = self.close_timeout.as_millis() as u64,
                    "Peer never answered the close frame, dropping the connection"
                );
                Ok(())
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
