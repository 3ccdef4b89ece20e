//! Wire codecs
//!
//! Frames travel as structured `serde_json::Value` payloads inside the client and
//! are encoded with exactly one codec per process: JSON over text messages or the
//! Erlang External Term Format over binary messages. The codec is chosen by
//! configuration and handed to the pool; nothing here keeps state.

mod etf;

use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A raw message as carried by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WireMessage {
    /// Length of the message body in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Codec failures
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON codec error")]
    Json(#[from] serde_json::Error),

    /// ETF input ended early or could not be read
    #[error("malformed term")]
    Malformed(#[from] std::io::Error),

    #[error("unsupported ETF format version {0}")]
    InvalidVersion(u8),

    #[error("unsupported ETF tag {0}")]
    UnsupportedTag(u8),

    #[error("ETF term declares {declared} bytes but only {remaining} remain")]
    Truncated { declared: usize, remaining: usize },

    #[error("invalid UTF-8 in binary")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("ETF term nesting exceeds {0} levels")]
    TooDeep(usize),

    #[error("value of {len} elements does not fit an ETF length field")]
    TooLarge { len: usize },

    #[error("cannot represent {0}")]
    Unrepresentable(&'static str),

    #[error("expected a {expected} message for this encoding")]
    UnexpectedMessageKind { expected: &'static str },

    #[error("unknown encoding '{0}' (expected 'json' or 'etf')")]
    UnknownEncoding(String),
}

/// Payload encoding negotiated with the gateway via the `encoding` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Text frames carrying JSON.
    Json,
    /// Binary frames carrying Erlang External Term Format. Smaller and faster to
    /// parse, so it is the default.
    #[default]
    Etf,
}

impl Encoding {
    /// Name sent as the `encoding` query parameter.
    pub fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Etf => "etf",
        }
    }

    /// Encode a structured payload into a transport message.
    pub fn encode(self, payload: &Value) -> Result<WireMessage, CodecError> {
        match self {
            Self::Json => Ok(WireMessage::Text(serde_json::to_string(payload)?)),
            Self::Etf => Ok(WireMessage::Binary(etf::encode(payload)?)),
        }
    }

    /// Decode a transport message into a structured payload.
    ///
    /// JSON also accepts binary messages holding UTF-8 JSON, since some servers
    /// deliver text payloads in binary frames.
    pub fn decode(self, message: &WireMessage) -> Result<Value, CodecError> {
        match (self, message) {
            (Self::Json, WireMessage::Text(text)) => Ok(serde_json::from_str(text)?),
            (Self::Json, WireMessage::Binary(bytes)) => Ok(serde_json::from_slice(bytes)?),
            (Self::Etf, WireMessage::Binary(bytes)) => etf::decode(bytes),
            (Self::Etf, WireMessage::Text(_)) => {
                Err(CodecError::UnexpectedMessageKind { expected: "binary" })
            }
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "etf" => Ok(Self::Etf),
            other => Err(CodecError::UnknownEncoding(other.to_string())),
        }
    }
}
