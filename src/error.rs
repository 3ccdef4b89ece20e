//! Domain error types for the gateway client
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns Result<T, GatewayError>.

use crate::codec::CodecError;
use thiserror::Error;

/// Gateway domain errors
///
/// Every variant carries structured context fields for diagnostics.
/// Steady-state variants (transport, codec, protocol) are recovered inside the
/// shard's reconnect loop; only `Bootstrap` and `Config` are meant to abort startup.
///
/// Example log output:
/// ```text
/// GatewayError::UnexpectedFrame { expected: "hello", op: 0 }
/// → "expected hello frame, received opcode 0"
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Control-plane bootstrap request (gateway URL + shard count) failed
    #[error("gateway bootstrap request failed")]
    Bootstrap(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Opening the duplex transport failed
    #[error("failed to open transport to {url}")]
    Connect {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Transport reported an error while sending, receiving or closing
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The server closed the connection before the handshake completed
    #[error("connection closed by server (code {code:?}): {reason}")]
    ConnectionClosed { code: Option<u16>, reason: String },

    /// A frame arrived that the handshake does not allow at this point
    #[error("expected {expected} frame, received opcode {op}")]
    UnexpectedFrame { expected: &'static str, op: u8 },

    /// Frame payload could not be encoded or decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Operation requires a live transport but the shard has none
    #[error("shard {shard_id} is not connected")]
    NotConnected { shard_id: u64 },

    /// Resume requested but no session has been established
    #[error("shard {shard_id} has no session to resume")]
    NoSession { shard_id: u64 },

    /// No shard with this index exists in the pool
    #[error("no shard with index {shard_id} in pool")]
    UnknownShard { shard_id: u64 },

    /// Shard task ended before it could answer
    #[error("shard {shard_id} terminated")]
    ShardTerminated { shard_id: u64 },

    /// Requested shard range does not fit the resolved shard count
    #[error("shard range {start}..{end} is invalid for {shard_count} shards")]
    InvalidShardRange {
        start: u64,
        end: u64,
        shard_count: u64,
    },

    /// NATS publish failed for a specific subject
    #[error("NATS publish failed for subject '{subject}'")]
    NatsPublishFailed {
        subject: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// NATS connection failed
    #[error("NATS connection failed")]
    NatsConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Event envelope serialization failed
    #[error("event serialization failed for {event_type} on shard {shard_id}")]
    SerializationFailed {
        event_type: String,
        shard_id: u64,
        #[source]
        source: serde_json::Error,
    },

    /// Prometheus recorder could not be installed
    #[error("metrics recorder installation failed: {0}")]
    MetricsInstall(String),

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `gateway_errors_total` counter,
    /// enabling per-error-type monitoring and alerting.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Bootstrap(_) => "bootstrap",
            Self::Connect { .. } => "connect",
            Self::Transport { .. } => "transport",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::UnexpectedFrame { .. } => "unexpected_frame",
            Self::Codec(_) => "codec",
            Self::NotConnected { .. } => "not_connected",
            Self::NoSession { .. } => "no_session",
            Self::UnknownShard { .. } => "unknown_shard",
            Self::ShardTerminated { .. } => "shard_terminated",
            Self::InvalidShardRange { .. } => "invalid_shard_range",
            Self::NatsPublishFailed { .. } => "nats_publish",
            Self::NatsConnectionFailed(_) => "nats_connection",
            Self::SerializationFailed { .. } => "serialization",
            Self::MetricsInstall(_) => "metrics_install",
            Self::Config(_) => "config",
        }
    }

    /// Whether the server (rather than the local side) ended the connection.
    ///
    /// Server-initiated closes back off longer than transport errors.
    pub fn is_server_close(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }
}
