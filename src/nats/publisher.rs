//! NATS event publisher
//!
//! Publishes dispatch envelopes to NATS JetStream. Shards emit synchronously, so
//! the sink hands envelopes to a background task that owns the publish awaits.
//! The hand-off queue is bounded; when the broker falls behind, new envelopes are
//! dropped and counted as route failures.

use crate::error::GatewayError;
use crate::events::{serialize_event, EventSink, GatewayEvent, ShardEvent};
use crate::metrics::GatewayMetrics;
use async_nats::jetstream::{self, Context as JsContext};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Envelopes waiting for a publish slot before new ones are dropped.
pub const SINK_BUFFER: usize = 1024;

/// Subject prefixes for routing
pub mod subjects {
    /// Dispatch events: events.{event_type}
    pub const EVENTS: &str = "events";
}

/// NATS publisher for gateway events
pub struct NatsPublisher {
    jetstream: JsContext,
    connected: AtomicBool,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl NatsPublisher {
    /// Connect to NATS server
    pub async fn connect(servers: &str) -> Result<Arc<Self>, GatewayError> {
        info!(servers, "Connecting to NATS");

        let client = async_nats::connect(servers)
            .await
            .map_err(|e| GatewayError::NatsConnectionFailed(Box::new(e)))?;

        let jetstream = jetstream::new(client);

        info!("Connected to NATS JetStream");

        Ok(Arc::new(Self {
            jetstream,
            connected: AtomicBool::new(true),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }))
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Get total messages published
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    /// Get total publish failures
    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    /// Publish a gateway event and wait for the stream acknowledgement
    pub async fn publish_event(&self, event: &GatewayEvent) -> Result<(), GatewayError> {
        let subject = route_event(event);
        let payload =
            serde_json::to_vec(event).map_err(|source| GatewayError::SerializationFailed {
                event_type: event.event_type.clone(),
                shard_id: event.shard_id,
                source,
            })?;

        debug!(
            event_type = %event.event_type,
            subject,
            event_id = %event.event_id,
            "Publishing event"
        );

        let publish_failed = |e: Box<dyn std::error::Error + Send + Sync>| {
            GatewayError::NatsPublishFailed {
                subject: subject.clone(),
                source: e,
            }
        };

        let result = match self.jetstream.publish(subject.clone(), payload.into()).await {
            Ok(ack_future) => ack_future.await.map_err(|e| publish_failed(Box::new(e))),
            Err(e) => Err(publish_failed(Box::new(e))),
        };

        match result {
            Ok(ack) => {
                self.messages_published.fetch_add(1, Ordering::Relaxed);
                debug!(subject, stream = %ack.stream, seq = ack.sequence, "Event published");
                Ok(())
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(subject, error = %e, "Failed to publish event");
                Err(e)
            }
        }
    }

    /// Graceful shutdown
    pub async fn close(&self) {
        info!("Closing NATS connection");
        self.connected.store(false, Ordering::SeqCst);
        // async-nats handles cleanup on drop
    }
}

/// Route event to its subject: `events.<event_type>`
pub fn route_event(event: &GatewayEvent) -> String {
    format!(
        "{}.{}",
        subjects::EVENTS,
        event.event_type.replace(&['.', ' ', '*', '>'][..], "_")
    )
}

/// `EventSink` that forwards dispatch events to NATS.
pub struct NatsSink {
    tx: mpsc::Sender<GatewayEvent>,
    metrics: Arc<GatewayMetrics>,
}

impl NatsSink {
    /// Spawn the publish task. Must be called within a Tokio runtime.
    pub fn spawn(publisher: Arc<NatsPublisher>, metrics: Arc<GatewayMetrics>) -> Self {
        let (tx, mut rx) = mpsc::channel::<GatewayEvent>(SINK_BUFFER);

        let task_metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match publisher.publish_event(&event).await {
                    Ok(()) => task_metrics.record_route_success(event.shard_id),
                    Err(e) => {
                        task_metrics.record_route_failure(event.shard_id);
                        task_metrics.record_error(event.shard_id, e.error_type_label());
                    }
                }
            }
            debug!("NATS sink channel closed");
        });

        Self { tx, metrics }
    }
}

impl EventSink for NatsSink {
    fn emit(&self, event: ShardEvent) {
        let Some(envelope) = serialize_event(&event) else {
            return;
        };
        match self.tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                self.metrics.record_route_failure(dropped.shard_id);
                warn!(
                    shard_id = dropped.shard_id,
                    event_type = %dropped.event_type,
                    "NATS publish queue full, dropping event"
                );
            }
            Err(TrySendError::Closed(_)) => {
                warn!(shard_id = event.shard_id(), "NATS sink task has stopped");
            }
        }
    }
}
