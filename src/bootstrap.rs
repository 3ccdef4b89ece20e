//! Gateway bootstrap
//!
//! One control-plane call resolves the gateway URL and the recommended shard count.
//! A failure here aborts startup; there is no retry.

use crate::error::GatewayError;
use async_trait::async_trait;
use tracing::info;
use twilight_http::Client;

/// Result of the bootstrap call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    pub url: String,
    pub shards: u64,
}

/// Source of gateway metadata.
#[async_trait]
pub trait GatewayInfoSource: Send + Sync {
    async fn gateway_info(&self) -> Result<GatewayInfo, GatewayError>;
}

/// Authenticated `GET /gateway/bot` via twilight-http (`Authorization: Bot <token>`).
pub struct HttpGatewayInfo {
    client: Client,
}

impl HttpGatewayInfo {
    pub fn new(token: String) -> Self {
        Self {
            client: Client::new(token),
        }
    }
}

#[async_trait]
impl GatewayInfoSource for HttpGatewayInfo {
    async fn gateway_info(&self) -> Result<GatewayInfo, GatewayError> {
        let response = self
            .client
            .gateway()
            .authed()
            .await
            .map_err(|e| GatewayError::Bootstrap(Box::new(e)))?;
        let info = response
            .model()
            .await
            .map_err(|e| GatewayError::Bootstrap(Box::new(e)))?;

        info!(
            url = %info.url,
            shards = info.shards,
            session_starts_remaining = info.session_start_limit.remaining,
            "Resolved gateway info"
        );

        Ok(GatewayInfo {
            url: info.url,
            shards: u64::from(info.shards),
        })
    }
}

/// Fixed gateway metadata, for deployments that know their gateway URL and tests.
#[derive(Debug, Clone)]
pub struct StaticGatewayInfo(pub GatewayInfo);

#[async_trait]
impl GatewayInfoSource for StaticGatewayInfo {
    async fn gateway_info(&self) -> Result<GatewayInfo, GatewayError> {
        Ok(self.0.clone())
    }
}

/// Build the transport URL: `<gateway>/?encoding=<name>&v=<version>`.
pub fn connect_url(gateway_url: &str, encoding: crate::codec::Encoding) -> String {
    format!(
        "{}/?encoding={}&v={}",
        gateway_url.trim_end_matches('/'),
        encoding.name(),
        crate::protocol::GATEWAY_VERSION
    )
}
