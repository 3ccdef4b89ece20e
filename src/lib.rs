//! shardgate - sharded gateway client
//!
//! Holds one resumable connection per shard, keeps each alive with heartbeats and
//! starts shards in sequence so new sessions are never identified faster than the
//! gateway allows.

pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod nats;
pub mod protocol;
pub mod shard;
pub mod transport;

pub use error::GatewayError;
