//! Shard management module
//!
//! One `ShardConnection` task per shard, started in order by a `ShardPool`.

mod connection;
mod pacer;
mod pool;
mod state;

pub use connection::{
    ShardCommand, ShardConnection, ShardContext, ShardHandle, ShardReady, CLOSE_CODE,
    CLOSE_REASON, ERROR_BACKOFF, INVALID_SESSION_BACKOFF, SERVER_CLOSE_BACKOFF,
};
pub use pacer::{StartupPacer, IDENTIFY_SPACING};
pub use pool::{PoolConfig, ShardPool};
pub use state::{ShardStage, ShardState};
