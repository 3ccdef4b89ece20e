//! Prometheus metrics module
//!
//! Recording goes through the `metrics` facade and is a no-op until a recorder is
//! installed, so shards can record unconditionally and tests need no exporter.

use crate::error::GatewayError;
use crate::protocol::OpCode;
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Gateway metrics collector
#[derive(Clone, Default)]
pub struct GatewayMetrics {
    handle: Option<Arc<PrometheusHandle>>,
}

impl GatewayMetrics {
    /// Metrics without an exporter (recording is discarded)
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the global Prometheus recorder and return a rendering collector
    pub fn install_prometheus() -> Result<Self, GatewayError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| GatewayError::MetricsInstall(e.to_string()))?;

        Self::register_metrics();

        Ok(Self {
            handle: Some(Arc::new(handle)),
        })
    }

    /// Register metric descriptions
    fn register_metrics() {
        describe_counter!(
            "gateway_frames_received_total",
            Unit::Count,
            "Frames received from the gateway, by opcode"
        );
        describe_counter!(
            "gateway_dispatch_events_total",
            Unit::Count,
            "Dispatch events received, by event type"
        );
        describe_counter!(
            "gateway_heartbeats_sent_total",
            Unit::Count,
            "Heartbeats sent"
        );
        describe_counter!(
            "gateway_heartbeat_acks_total",
            Unit::Count,
            "Heartbeat acknowledgements received"
        );
        describe_counter!(
            "gateway_sessions_total",
            Unit::Count,
            "Session handshakes sent (identify or resume)"
        );
        describe_counter!(
            "gateway_reconnects_total",
            Unit::Count,
            "Reconnects scheduled, by reason"
        );
        describe_counter!(
            "gateway_events_routed_total",
            Unit::Count,
            "Total events routed to NATS"
        );
        describe_counter!(
            "gateway_route_failures_total",
            Unit::Count,
            "Failed event routes to NATS"
        );
        describe_counter!(
            "gateway_errors_total",
            Unit::Count,
            "Total gateway errors"
        );

        describe_gauge!(
            "gateway_shards_ready",
            Unit::Count,
            "Number of shards in ready state"
        );
        describe_gauge!(
            "gateway_last_heartbeat_ack_timestamp",
            Unit::Seconds,
            "Unix time of the last heartbeat acknowledgement"
        );
        describe_gauge!(
            "gateway_nats_connected",
            Unit::Count,
            "NATS connection status (1=connected, 0=disconnected)"
        );
    }

    /// Record a received frame
    pub fn record_frame(&self, shard_id: u64, op: u8) {
        let op = OpCode::from_u8(op).map_or("unknown", OpCode::label);
        counter!(
            "gateway_frames_received_total",
            "shard_id" => shard_id.to_string(),
            "op" => op
        )
        .increment(1);
    }

    /// Record a dispatch event
    pub fn record_dispatch(&self, shard_id: u64, event_type: &str) {
        counter!(
            "gateway_dispatch_events_total",
            "shard_id" => shard_id.to_string(),
            "event_type" => event_type.to_ascii_lowercase()
        )
        .increment(1);
    }

    /// Record a heartbeat sent
    pub fn record_heartbeat_sent(&self, shard_id: u64) {
        counter!(
            "gateway_heartbeats_sent_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    /// Record a heartbeat acknowledgement
    pub fn record_heartbeat_ack(&self, shard_id: u64) {
        counter!(
            "gateway_heartbeat_acks_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64());
        gauge!(
            "gateway_last_heartbeat_ack_timestamp",
            "shard_id" => shard_id.to_string()
        )
        .set(now);
    }

    /// Record a session handshake (`identify` or `resume`)
    pub fn record_session(&self, shard_id: u64, kind: &'static str) {
        counter!(
            "gateway_sessions_total",
            "shard_id" => shard_id.to_string(),
            "kind" => kind
        )
        .increment(1);
    }

    /// Record a scheduled reconnect
    pub fn record_reconnect(&self, shard_id: u64, reason: &'static str) {
        counter!(
            "gateway_reconnects_total",
            "shard_id" => shard_id.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Record successful route to NATS
    pub fn record_route_success(&self, shard_id: u64) {
        counter!(
            "gateway_events_routed_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    /// Record failed route
    pub fn record_route_failure(&self, shard_id: u64) {
        counter!(
            "gateway_route_failures_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    /// Record gateway error
    pub fn record_error(&self, shard_id: u64, error_type: &'static str) {
        counter!(
            "gateway_errors_total",
            "shard_id" => shard_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }

    /// Set shards ready count
    pub fn set_shards_ready(&self, count: usize) {
        gauge!("gateway_shards_ready").set(count as f64);
    }

    /// Set NATS connection status
    pub fn set_nats_connected(&self, connected: bool) {
        gauge!("gateway_nats_connected").set(if connected { 1.0 } else { 0.0 });
    }

    /// Render metrics in Prometheus format (empty without an exporter)
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_exporter_is_harmless() {
        let metrics = GatewayMetrics::new();
        metrics.record_frame(0, 11);
        metrics.record_frame(0, 200);
        metrics.record_dispatch(0, "MESSAGE_CREATE");
        metrics.record_reconnect(0, "heartbeat_timeout");
        assert_eq!(metrics.render(), "");
    }
}
