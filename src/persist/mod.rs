pub mod types;
pub use types::*;
pub mod compression;
pub mod event_store;
pub mod export;
pub mod schema;
pub mod snapshot;
pub mod sqlite;

pub use compression::{CompressionConfig, CompressionManager};
pub use event_store::{EventStats, EventStore, EventStoreConfig};

use async_trait::async_trait;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot taken at or before `at_or_before_ms` (any time when `None`).
    async fn load_snapshot(&self, aggregate_id: &str, at_or_before_ms: Option<i64>) -> PersistResult<Option<SnapshotData>>;
    async fn save_snapshot(&self, snapshot: &SnapshotData) -> PersistResult<()>;
}
