//! Duplex transport boundary
//!
//! A `Connector` opens transports; a successful `connect` is the "open" event.
//! After that the owner pulls `TransportEvent`s one at a time and may send or close.

mod websocket;

pub use websocket::{WebSocketConnector, WebSocketTransport, CLOSE_HANDSHAKE_TIMEOUT};

use crate::codec::WireMessage;
use crate::error::GatewayError;
use async_trait::async_trait;

/// Something that happened on an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An inbound message, in delivery order.
    Message(WireMessage),
    /// The peer closed the connection (or it dropped without a close frame).
    Closed { code: Option<u16>, reason: String },
    /// The transport failed; no further events will follow.
    Error(String),
}

/// One live duplex connection.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, message: WireMessage) -> Result<(), GatewayError>;

    /// Next event from the peer. Must be cancel safe: it is raced against timers.
    async fn next_event(&mut self) -> TransportEvent;

    /// Request a close and wait for the close handshake to finish.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), GatewayError>;

    /// True once a close was observed or completed.
    fn is_closed(&self) -> bool;
}

/// Opens transports to a URL.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, GatewayError>;
}
