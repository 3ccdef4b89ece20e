//! Event serialization for message broker
//!
//! Wraps dispatch events in a JSON envelope for NATS publishing. The payload is
//! forwarded opaquely; only envelope fields are derived here.

use super::ShardEvent;
use serde::Serialize;
use uuid::Uuid;

/// Generic gateway event envelope
#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub event_id: String,
    pub event_type: String,
    pub shard_id: u64,
    pub timestamp: u64,
    pub data: serde_json::Value,
}

/// Wrap a shard event in a `GatewayEvent` envelope
///
/// Returns None for events we don't forward (diagnostics and raw payloads)
pub fn serialize_event(event: &ShardEvent) -> Option<GatewayEvent> {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64);

    match event {
        ShardEvent::Dispatch {
            shard_id,
            event_type,
            data,
        } => Some(GatewayEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.to_ascii_lowercase(),
            shard_id: *shard_id,
            timestamp,
            data: data.clone(),
        }),

        // Local observability only
        ShardEvent::Debug { .. } | ShardEvent::Payload { .. } => None,
    }
}
