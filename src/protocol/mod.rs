//! Gateway protocol vocabulary
//!
//! Operation codes, the `{op, d, s, t}` frame envelope, and the typed payloads the
//! client sends (identify, resume, heartbeat) or must parse (hello, ready).

mod heartbeat;

pub use heartbeat::{HeartbeatAction, TickStep};

use crate::codec::{Encoding, WireMessage};
use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gateway API version requested in the connect URL.
pub const GATEWAY_VERSION: u8 = 10;

/// Dispatch event name carrying the new session id.
pub const READY_EVENT: &str = "READY";

/// Dispatch event name confirming a successful resume.
pub const RESUMED_EVENT: &str = "RESUMED";

/// Identify `large_threshold`: members beyond which offline members are omitted.
pub const LARGE_THRESHOLD: u64 = 250;

/// Gateway operation codes used by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Application event (received)
    Dispatch = 0,
    /// Liveness beat (sent; the server may also request one)
    Heartbeat = 1,
    /// New session handshake (sent)
    Identify = 2,
    /// Session replay handshake (sent)
    Resume = 6,
    /// Server asks the client to reconnect and resume (received)
    Reconnect = 7,
    /// Session rejected (received)
    InvalidSession = 9,
    /// First frame on a new transport, carries the heartbeat interval (received)
    Hello = 10,
    /// Heartbeat acknowledged (received)
    HeartbeatAck = 11,
}

impl OpCode {
    pub fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            6 => Self::Resume,
            7 => Self::Reconnect,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }

    /// Metric label for frames carrying this opcode.
    pub fn label(self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Heartbeat => "heartbeat",
            Self::Identify => "identify",
            Self::Resume => "resume",
            Self::Reconnect => "reconnect",
            Self::InvalidSession => "invalid_session",
            Self::Hello => "hello",
            Self::HeartbeatAck => "heartbeat_ack",
        }
    }
}

/// The envelope every gateway frame shares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayFrame {
    /// Build a client command frame (no sequence, no event name).
    pub fn command(op: OpCode, d: impl Serialize) -> Result<Self, GatewayError> {
        Ok(Self {
            op: op as u8,
            d: serde_json::to_value(d).map_err(crate::codec::CodecError::from)?,
            s: None,
            t: None,
        })
    }

    /// `{op: 1, d: <last sequence or null>}`
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self {
            op: OpCode::Heartbeat as u8,
            d: sequence.map_or(Value::Null, Value::from),
            s: None,
            t: None,
        }
    }

    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.op)
    }

    pub fn is(&self, op: OpCode) -> bool {
        self.op == op as u8
    }

    /// Event name of a dispatch frame.
    pub fn event_type(&self) -> Option<&str> {
        self.t.as_deref()
    }

    pub fn to_value(&self) -> Result<Value, GatewayError> {
        Ok(serde_json::to_value(self).map_err(crate::codec::CodecError::from)?)
    }

    pub fn from_value(value: Value) -> Result<Self, GatewayError> {
        Ok(serde_json::from_value(value).map_err(crate::codec::CodecError::from)?)
    }

    /// Encode for the wire with the negotiated codec.
    pub fn encode(&self, encoding: Encoding) -> Result<WireMessage, GatewayError> {
        Ok(encoding.encode(&self.to_value()?)?)
    }

    /// Decode a wire message with the negotiated codec.
    pub fn decode(encoding: Encoding, message: &WireMessage) -> Result<Self, GatewayError> {
        Self::from_value(encoding.decode(message)?)
    }
}

/// `d` of the hello frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

impl Hello {
    /// Extract hello from the first frame of a transport; any other opcode is a
    /// protocol violation.
    pub fn from_frame(frame: &GatewayFrame) -> Result<Self, GatewayError> {
        if !frame.is(OpCode::Hello) {
            return Err(GatewayError::UnexpectedFrame {
                expected: "hello",
                op: frame.op,
            });
        }
        Ok(serde_json::from_value(frame.d.clone()).map_err(crate::codec::CodecError::from)?)
    }
}

/// Fixed connection properties reported in identify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// `d` of the identify command.
#[derive(Debug, Clone, Serialize)]
pub struct Identify<'a> {
    pub token: &'a str,
    pub properties: ConnectionProperties,
    pub shard: [u64; 2],
    pub compress: bool,
    pub large_threshold: u64,
    pub intents: u64,
}

impl<'a> Identify<'a> {
    pub fn new(token: &'a str, shard_id: u64, total_shards: u64, intents: u64) -> Self {
        Self {
            token,
            properties: ConnectionProperties::default(),
            shard: [shard_id, total_shards],
            compress: false,
            large_threshold: LARGE_THRESHOLD,
            intents,
        }
    }
}

/// `d` of the resume command.
#[derive(Debug, Clone, Serialize)]
pub struct Resume<'a> {
    pub token: &'a str,
    pub session_id: &'a str,
    pub seq: Option<u64>,
}

/// Session id from the `d` of a READY dispatch.
pub fn ready_session_id(frame: &GatewayFrame) -> Option<&str> {
    frame.d.get("session_id").and_then(Value::as_str)
}

/// Whether an invalid-session frame allows resuming (`d: true`).
pub fn invalid_session_resumable(frame: &GatewayFrame) -> bool {
    frame.d.as_bool().unwrap_or(false)
}
