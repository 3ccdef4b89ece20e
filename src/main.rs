//! shardgate - sharded gateway client
//!
//! Runs a range of shards in one process:
//! - Resolves the gateway URL and shard count with one bootstrap call
//! - Starts shards in order, pacing identifies
//! - Publishes dispatch events to NATS JetStream when configured
//! - Exposes health/ready endpoints and Prometheus metrics

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use shardgate::bootstrap::HttpGatewayInfo;
use shardgate::config::GatewayConfig;
use shardgate::events::{EventSink, TracingSink};
use shardgate::health::{self, AppState};
use shardgate::metrics::GatewayMetrics;
use shardgate::nats::{NatsPublisher, NatsSink};
use shardgate::shard::{PoolConfig, ShardPool};
use shardgate::transport::WebSocketConnector;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let gateway_config = GatewayConfig::from_env()?;

    // Initialize tracing with configured log level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("shardgate={}", gateway_config.log_level).parse()?)
                .add_directive("tungstenite=info".parse()?)
                .add_directive("async_nats=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        shard_count = ?gateway_config.shard_count,
        shard_start = gateway_config.shard_start,
        shard_end = ?gateway_config.shard_end,
        encoding = %gateway_config.encoding,
        "Starting shardgate"
    );

    let metrics = Arc::new(GatewayMetrics::install_prometheus()?);
    info!("Prometheus metrics initialized");

    // Connect to NATS if configured
    let nats = if let Some(ref url) = gateway_config.nats_url {
        match NatsPublisher::connect(url).await {
            Ok(publisher) => {
                info!(url, "Connected to NATS");
                metrics.set_nats_connected(true);
                Some(publisher)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to NATS - running in local mode");
                metrics.set_nats_connected(false);
                None
            }
        }
    } else {
        info!("No NATS_URL configured - running in local mode");
        None
    };

    let sink: Arc<dyn EventSink> = match nats {
        Some(ref publisher) => Arc::new(NatsSink::spawn(
            Arc::clone(publisher),
            Arc::clone(&metrics),
        )),
        None => Arc::new(TracingSink),
    };

    let intents = gateway_config.intents;
    info!(?intents, "Using gateway intents");

    let mut pool = ShardPool::new(
        PoolConfig {
            token: gateway_config.discord_token.clone(),
            shard_count: gateway_config.shard_count,
            encoding: gateway_config.encoding,
            intents: intents.bits(),
        },
        Arc::new(HttpGatewayInfo::new(gateway_config.discord_token.clone())),
        Arc::new(WebSocketConnector::default()),
        sink,
        Arc::clone(&metrics),
    );

    // Start health server
    let app_state = AppState {
        shard_state: pool.state(),
        nats: nats.clone(),
        metrics: Arc::clone(&metrics),
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], gateway_config.http_port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(port = gateway_config.http_port, "Starting HTTP server");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health_router).await {
            error!(error = %e, "HTTP server error");
        }
    });

    // Startup is sequential and can take a while; a signal may arrive before it ends
    let startup = tokio::select! {
        result = pool.connect(gateway_config.shard_start, gateway_config.shard_end) => Some(result),
        _ = shutdown_signal() => None,
    };

    match startup {
        Some(Ok(())) => {
            info!(
                shard_count = ?pool.shard_count(),
                shards_ready = pool.state().ready_shards(),
                "All shards started"
            );
            shutdown_signal().await;
            info!("Shutdown signal received");
        }
        Some(Err(e)) => {
            error!(error = %e, "Shard startup failed");
            pool.shutdown().await;
            return Err(e.into());
        }
        None => info!("Shutdown signal received during startup"),
    }

    // Graceful shutdown
    info!("Shutting down gateway...");
    pool.shutdown().await;

    if let Some(ref nats) = nats {
        nats.close().await;
    }

    info!("Gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
