//! Shard pool implementation
//!
//! Starts shards strictly one after another. Each shard is awaited until READY
//! before the next one is spawned, and the shared pacer holds the next identify back
//! until the spacing since that READY has passed.

use crate::bootstrap::{GatewayInfo, GatewayInfoSource};
use crate::codec::Encoding;
use crate::config::ShardCount;
use crate::error::GatewayError;
use crate::events::EventSink;
use crate::metrics::GatewayMetrics;
use crate::shard::connection::{ShardConnection, ShardContext, ShardHandle};
use crate::shard::pacer::StartupPacer;
use crate::shard::state::ShardState;
use crate::transport::Connector;

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Settings every shard of the pool shares.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub token: String,
    pub shard_count: ShardCount,
    pub encoding: Encoding,
    pub intents: u64,
}

/// Shard pool owning the connections of this process
pub struct ShardPool {
    config: PoolConfig,
    bootstrap: Arc<dyn GatewayInfoSource>,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn EventSink>,
    metrics: Arc<GatewayMetrics>,
    state: ShardState,
    pacer: Arc<StartupPacer>,
    shards: BTreeMap<u64, ShardHandle>,
    total_shards: Option<u64>,
    last_ready: Option<Instant>,
}

impl ShardPool {
    pub fn new(
        config: PoolConfig,
        bootstrap: Arc<dyn GatewayInfoSource>,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn EventSink>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            config,
            bootstrap,
            connector,
            sink,
            metrics,
            state: ShardState::new(),
            pacer: Arc::new(StartupPacer::default()),
            shards: BTreeMap::new(),
            total_shards: None,
            last_ready: None,
        }
    }

    /// Get shared state (for health checks)
    pub fn state(&self) -> ShardState {
        self.state.clone()
    }

    /// Total shard count, once resolved by `connect`
    pub fn shard_count(&self) -> Option<u64> {
        self.total_shards
    }

    /// When the most recently started shard reached READY
    pub fn last_ready(&self) -> Option<Instant> {
        self.last_ready
    }

    /// Indices of the shards this pool runs
    pub fn shard_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.shards.keys().copied()
    }

    /// One bootstrap request. Failure is fatal to startup.
    pub async fn gateway_info(&self) -> Result<GatewayInfo, GatewayError> {
        self.bootstrap.gateway_info().await.map_err(|e| {
            error!(error = %e, "Gateway bootstrap failed");
            self.metrics.record_error(0, e.error_type_label());
            e
        })
    }

    /// Start shards `start..end` (`end` defaults to the shard count) in order.
    ///
    /// An existing shard at an index is closed before its replacement starts.
    /// Returns once the last shard of the range is ready.
    pub async fn connect(&mut self, start: u64, end: Option<u64>) -> Result<(), GatewayError> {
        let info = self.gateway_info().await?;

        let total_shards = match self.config.shard_count {
            ShardCount::Fixed(count) => count,
            ShardCount::Auto => info.shards.max(1),
        };
        let end = end.unwrap_or(total_shards);
        if start >= end || end > total_shards {
            return Err(GatewayError::InvalidShardRange {
                start,
                end,
                shard_count: total_shards,
            });
        }
        self.total_shards = Some(total_shards);

        let ctx = Arc::new(ShardContext {
            token: self.config.token.clone(),
            gateway_url: info.url,
            encoding: self.config.encoding,
            total_shards,
            intents: self.config.intents,
            connector: Arc::clone(&self.connector),
            sink: Arc::clone(&self.sink),
            pacer: Arc::clone(&self.pacer),
            state: self.state.clone(),
            metrics: Arc::clone(&self.metrics),
        });

        info!(
            start,
            end,
            total_shards,
            encoding = %self.config.encoding,
            "Starting shards"
        );

        for shard_id in start..end {
            if let Some(existing) = self.shards.remove(&shard_id) {
                info!(shard_id, "Closing existing shard before restart");
                if let Err(e) = existing.close().await {
                    warn!(shard_id, error = %e, "Existing shard did not close cleanly");
                }
            }

            self.state.register(shard_id);
            let (handle, ready) = ShardConnection::new(shard_id, Arc::clone(&ctx)).spawn();
            self.shards.insert(shard_id, handle);

            let ready = ready
                .await
                .map_err(|_| GatewayError::ShardTerminated { shard_id })?;
            self.pacer.mark_ready(ready.time_ready);
            self.last_ready = Some(ready.time_ready);

            info!(
                shard_id,
                session_id = %ready.session_id,
                ready_shards = self.state.ready_shards(),
                "Shard started"
            );
        }

        Ok(())
    }

    /// Send a payload on one shard's connection.
    pub async fn send(&self, payload: Value, shard_id: u64) -> Result<(), GatewayError> {
        let shard = self
            .shards
            .get(&shard_id)
            .ok_or(GatewayError::UnknownShard { shard_id })?;
        shard.send(payload).await
    }

    /// Close every shard for good, in index order.
    pub async fn shutdown(&mut self) {
        for (shard_id, handle) in std::mem::take(&mut self.shards) {
            if let Err(e) = handle.close().await {
                warn!(shard_id, error = %e, "Shard did not close cleanly");
            }
        }
        info!("Shard pool shut down");
    }
}
