// Tiered, per-type TTL cache in front of consumers
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod disk;
pub mod manager;
pub mod types;

pub use manager::CacheManager;
pub use types::*;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{class} ttl of {ttl_ms}ms is outside [{min}, {max}]", min = MIN_TTL_MS, max = MAX_TTL_MS)]
    InvalidTtl { class: &'static str, ttl_ms: u64 },

    #[error("disk cache I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("disk cache entry unreadable: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<CacheError> for crate::error::FeedError {
    fn from(e: CacheError) -> Self {
        crate::error::FeedError::Storage(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl: CacheTtlConfig,
    pub max_entries: usize,
    pub max_bytes: usize,
    pub shards: usize,
    /// Enables the disk tier for non-price entries.
    pub disk_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: CacheTtlConfig::default(),
            max_entries: 1_000,
            max_bytes: 100 * 1024 * 1024,
            shards: 16,
            disk_dir: None,
        }
    }
}
