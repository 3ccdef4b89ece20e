//! Event handling module
//!
//! Classified protocol and application events leave the shard machinery through an
//! `EventSink`. The sink is an emit target only: it never feeds back into connection
//! control, and `emit` must not block.

pub mod serialize;

pub use serialize::{serialize_event, GatewayEvent};

use crate::protocol::GatewayFrame;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Event surfaced by a shard.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardEvent {
    /// Diagnostic message for a state transition or failure.
    Debug { shard_id: u64, message: String },
    /// Every inbound frame, verbatim.
    Payload { shard_id: u64, frame: GatewayFrame },
    /// Application event from a dispatch frame, under its event name.
    Dispatch {
        shard_id: u64,
        event_type: String,
        data: Value,
    },
}

impl ShardEvent {
    pub fn shard_id(&self) -> u64 {
        match self {
            Self::Debug { shard_id, .. }
            | Self::Payload { shard_id, .. }
            | Self::Dispatch { shard_id, .. } => *shard_id,
        }
    }

    /// Sink-facing name: `DEBUG`, `PAYLOAD` or the dispatch event type.
    pub fn name(&self) -> &str {
        match self {
            Self::Debug { .. } => "DEBUG",
            Self::Payload { .. } => "PAYLOAD",
            Self::Dispatch { event_type, .. } => event_type,
        }
    }
}

/// Receiver of shard events.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: ShardEvent);
}

/// Writes events to the tracing subscriber. Used when nothing else consumes them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ShardEvent) {
        match event {
            // Shards already trace their diagnostics
            ShardEvent::Debug { .. } => {}
            ShardEvent::Payload { shard_id, frame } => {
                trace!(shard_id, op = frame.op, seq = ?frame.s, "Gateway payload");
            }
            ShardEvent::Dispatch {
                shard_id,
                event_type,
                ..
            } => {
                debug!(shard_id, event_type, "Dispatch event");
            }
        }
    }
}

/// Forwards events into an unbounded channel for in-process consumers.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ShardEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ShardEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ShardEvent) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.tx.send(event);
    }
}
