//! NATS JetStream integration
//!
//! Publishes gateway dispatch events to NATS streams

mod publisher;

pub use publisher::{route_event, NatsPublisher, NatsSink};
