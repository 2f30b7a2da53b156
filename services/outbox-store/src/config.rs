//! Store and exchange configuration

use std::path::PathBuf;

/// Server API version stamped on messages that do not carry one.
pub const DEFAULT_API: &str = "3.2";

/// Configuration for a [`MessageStore`](crate::store::MessageStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base directory of the shard hierarchy.
    pub dir: PathBuf,
    /// Maximum number of records per shard directory (default 1000).
    pub shard_capacity: usize,
    /// API version filled into messages lacking an `api` field.
    pub api: String,
    /// Fsync each record before it is renamed into place.
    pub sync_writes: bool,
}

impl StoreConfig {
    /// Create a config with sensible defaults.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            shard_capacity: 1000,
            api: DEFAULT_API.to_string(),
            sync_writes: true,
        }
    }
}

/// Configuration for the [`ExchangeDriver`](crate::exchange::ExchangeDriver).
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Maximum number of messages sent per exchange.
    pub batch_size: usize,
    /// Consecutive successful exchanges required before already
    /// acknowledged messages are deleted.
    pub deletion_streak: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            deletion_streak: 2,
        }
    }
}
