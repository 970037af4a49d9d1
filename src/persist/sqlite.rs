use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::persist::snapshot::{decode_state, encode_state};
use crate::persist::types::{PersistResult, SnapshotData};
use crate::persist::SnapshotStore;

/// Audit snapshots in the `snapshots` table, state encoded with bincode.
#[derive(Debug, Clone)]
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn load_snapshot(&self, aggregate_id: &str, at_or_before_ms: Option<i64>) -> PersistResult<Option<SnapshotData>> {
        let row = sqlx::query(
            r#"
            SELECT schema_version, sequence, timestamp, state_data
            FROM snapshots
            WHERE aggregate_id = ?1 AND timestamp <= ?2
            ORDER BY sequence DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate_id)
        .bind(at_or_before_ms.unwrap_or(i64::MAX))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let version: i64 = row.try_get("schema_version")?;
        let sequence: i64 = row.try_get("sequence")?;
        let blob: Vec<u8> = row.try_get("state_data")?;
        Ok(Some(SnapshotData {
            version: version as u32,
            aggregate_id: aggregate_id.to_string(),
            sequence: sequence as u64,
            timestamp: row.try_get("timestamp")?,
            state: decode_state(version as u32, &blob)?,
        }))
    }

    async fn save_snapshot(&self, snapshot: &SnapshotData) -> PersistResult<()> {
        let blob = encode_state(&snapshot.state)?;
        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, schema_version, sequence, timestamp, state_data)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&snapshot.aggregate_id)
        .bind(snapshot.version as i64)
        .bind(snapshot.sequence as i64)
        .bind(snapshot.timestamp)
        .bind(blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
