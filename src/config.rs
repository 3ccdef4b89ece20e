//! Gateway configuration module
//!
//! Handles loading configuration from environment variables.

use crate::codec::Encoding;
use crate::error::GatewayError;
use std::env;
use std::str::FromStr;
use twilight_model::gateway::Intents;

/// How many shards the pool runs in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardCount {
    /// Use the count recommended by the bootstrap call
    #[default]
    Auto,
    /// Fixed shard count
    Fixed(u64),
}

impl FromStr for ShardCount {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        match s.parse::<u64>() {
            Ok(0) => Err(GatewayError::Config(
                "SHARD_COUNT must be at least 1".to_string(),
            )),
            Ok(count) => Ok(Self::Fixed(count)),
            Err(e) => Err(GatewayError::Config(format!(
                "SHARD_COUNT must be 'auto' or a number: {e}"
            ))),
        }
    }
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Discord bot token
    pub discord_token: String,

    /// Total shard count (auto-resolved unless fixed)
    pub shard_count: ShardCount,

    /// First shard index this process starts
    pub shard_start: u64,

    /// One past the last shard index this process starts (defaults to shard count)
    pub shard_end: Option<u64>,

    /// Payload encoding negotiated with the gateway
    pub encoding: Encoding,

    /// Gateway intents sent in identify
    pub intents: Intents,

    /// NATS server URL(s) - comma-separated for multiple servers
    pub nats_url: Option<String>,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let discord_token = env::var("DISCORD_TOKEN")
            .or_else(|_| env::var("DISCORD_BOT_TOKEN"))
            .map_err(|_| GatewayError::Config(
                "DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string(),
            ))?;

        let shard_count = env::var("SHARD_COUNT")
            .or_else(|_| env::var("TOTAL_SHARDS"))
            .unwrap_or_else(|_| "auto".to_string())
            .parse()?;

        let shard_start = env::var("SHARD_START")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|e| GatewayError::Config(format!("SHARD_START must be a valid number: {e}")))?;

        let shard_end = env::var("SHARD_END")
            .ok()
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|e| GatewayError::Config(format!("SHARD_END must be a valid number: {e}")))?;

        let encoding = match env::var("GATEWAY_ENCODING") {
            Ok(name) => name
                .parse()
                .map_err(|e| GatewayError::Config(format!("GATEWAY_ENCODING: {e}")))?,
            Err(_) => Encoding::default(),
        };

        let intents = match env::var("GATEWAY_INTENTS") {
            Ok(bits) => {
                let bits = bits.trim().parse::<u64>().map_err(|e| {
                    GatewayError::Config(format!("GATEWAY_INTENTS must be a valid bitfield: {e}"))
                })?;
                Intents::from_bits_truncate(bits)
            }
            Err(_) => Self::default_intents(),
        };

        let nats_url = env::var("NATS_URL").ok();

        let http_port = env::var("HTTP_PORT")
            .or_else(|_| env::var("METRICS_PORT"))
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .map_err(|e| GatewayError::Config(format!("HTTP_PORT must be a valid port number: {e}")))?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            discord_token,
            shard_count,
            shard_start,
            shard_end,
            encoding,
            intents,
            nats_url,
            http_port,
            log_level,
        })
    }

    /// Default Discord intents
    ///
    /// - GUILDS: Required for guild lifecycle events
    /// - GUILD_MEMBERS: Required for member events (privileged)
    pub fn default_intents() -> Intents {
        Intents::GUILDS | Intents::GUILD_MEMBERS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_intents_are_minimal() {
        let intents = GatewayConfig::default_intents();

        assert!(intents.contains(Intents::GUILDS));
        assert!(intents.contains(Intents::GUILD_MEMBERS));

        // Should NOT have message content (privileged, not needed)
        assert!(!intents.contains(Intents::MESSAGE_CONTENT));
    }

    #[test]
    fn test_shard_count_parsing() {
        assert_eq!("auto".parse::<ShardCount>().unwrap(), ShardCount::Auto);
        assert_eq!("AUTO".parse::<ShardCount>().unwrap(), ShardCount::Auto);
        assert_eq!(" 16 ".parse::<ShardCount>().unwrap(), ShardCount::Fixed(16));
        assert!(matches!(
            "0".parse::<ShardCount>(),
            Err(GatewayError::Config(_))
        ));
        assert!(matches!(
            "many".parse::<ShardCount>(),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_default_shard_count_is_auto() {
        assert_eq!(ShardCount::default(), ShardCount::Auto);
    }
}
