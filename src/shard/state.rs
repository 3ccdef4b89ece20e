//! Shard state tracking
//!
//! Mirrors each shard's connection stage and counters for health endpoints.
//! Writers are the shard tasks themselves; readers never block them.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// Connection stage of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStage {
    /// Opening the transport
    Connecting,
    /// Transport open, waiting for the hello frame
    AwaitingHello,
    /// Identify pending or sent, waiting for READY
    Identifying,
    /// Resume sent, replaying missed events
    Resuming,
    /// Session established and receiving events
    Ready,
    /// Closing the transport
    Closing,
    /// Waiting out a backoff before reconnecting
    Reconnecting,
    /// Shut down for good
    Terminated,
}

impl ShardStage {
    /// Returns true if the shard is healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, ShardStage::Ready | ShardStage::Resuming)
    }

    /// Returns true if the shard is ready to receive events
    pub fn is_ready(&self) -> bool {
        matches!(self, ShardStage::Ready)
    }
}

/// State for a single shard
#[derive(Debug)]
pub struct ShardStateEntry {
    pub stage: ShardStage,
    pub sequence: Option<u64>,
    pub frames_received: AtomicU64,
    pub dispatches: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_heartbeat_ack: Option<Instant>,
    pub ready_at: Option<Instant>,
}

impl Default for ShardStateEntry {
    fn default() -> Self {
        Self {
            stage: ShardStage::Connecting,
            sequence: None,
            frames_received: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_heartbeat_ack: None,
            ready_at: None,
        }
    }
}

/// Shared state across all shards in a pool
#[derive(Debug, Clone, Default)]
pub struct ShardState {
    inner: Arc<ShardStateInner>,
}

#[derive(Debug, Default)]
struct ShardStateInner {
    shards: DashMap<u64, ShardStateEntry>,
}

impl ShardState {
    /// Create an empty shard state tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a shard, resetting any previous entry
    pub fn register(&self, shard_id: u64) {
        self.inner.shards.insert(shard_id, ShardStateEntry::default());
    }

    /// Update shard stage
    pub fn set_stage(&self, shard_id: u64, stage: ShardStage) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.stage = stage;
            if stage == ShardStage::Ready {
                entry.ready_at = Some(Instant::now());
            }
        }
    }

    /// Update last seen sequence
    pub fn set_sequence(&self, shard_id: u64, sequence: Option<u64>) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.sequence = sequence;
        }
    }

    /// Increment frame counter
    pub fn record_frame(&self, shard_id: u64) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.frames_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Increment dispatch counter
    pub fn record_dispatch(&self, shard_id: u64) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.dispatches.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Increment reconnect counter
    pub fn record_reconnect(&self, shard_id: u64) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record heartbeat acknowledgement
    pub fn record_heartbeat_ack(&self, shard_id: u64) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.last_heartbeat_ack = Some(Instant::now());
        }
    }

    /// Get stage for a specific shard
    pub fn get_stage(&self, shard_id: u64) -> Option<ShardStage> {
        self.inner.shards.get(&shard_id).map(|e| e.stage)
    }

    /// Get last seen sequence for a specific shard
    pub fn get_sequence(&self, shard_id: u64) -> Option<u64> {
        self.inner.shards.get(&shard_id).and_then(|e| e.sequence)
    }

    /// Get reconnect count for a specific shard
    pub fn reconnects(&self, shard_id: u64) -> u64 {
        self.inner
            .shards
            .get(&shard_id)
            .map_or(0, |e| e.reconnects.load(Ordering::Relaxed))
    }

    /// Get total frames received across all shards
    pub fn total_frames_received(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.frames_received.load(Ordering::Relaxed))
            .sum()
    }

    /// Get total dispatch events across all shards
    pub fn total_dispatches(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.dispatches.load(Ordering::Relaxed))
            .sum()
    }

    /// Get count of ready shards
    pub fn ready_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.stage.is_ready())
            .count()
    }

    /// Get count of healthy shards (ready or resuming)
    pub fn healthy_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.stage.is_healthy())
            .count()
    }

    /// Get total tracked shard count
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Check if pool is ready (at least one shard ready)
    pub fn is_ready(&self) -> bool {
        self.ready_shards() > 0
    }

    /// Check if pool is fully healthy
    pub fn is_healthy(&self) -> bool {
        self.healthy_shards() == self.shard_count()
    }
}
