// DDL shared by the event store and the compression job.
use sqlx::SqlitePool;

use crate::persist::types::PersistResult;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    position     INTEGER PRIMARY KEY AUTOINCREMENT,
    id           TEXT    NOT NULL UNIQUE,
    event_type   TEXT    NOT NULL,
    aggregate_id TEXT    NOT NULL,
    sequence     INTEGER NOT NULL,
    timestamp    INTEGER NOT NULL,
    event_data   TEXT    NOT NULL,
    UNIQUE (aggregate_id, sequence)
);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);

CREATE TABLE IF NOT EXISTS snapshots (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    aggregate_id   TEXT    NOT NULL,
    schema_version INTEGER NOT NULL,
    sequence       INTEGER NOT NULL,
    timestamp      INTEGER NOT NULL,
    state_data     BLOB    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_aggregate ON snapshots(aggregate_id, sequence DESC);

CREATE TABLE IF NOT EXISTS compressed_data (
    id                 TEXT    NOT NULL,
    record_type        TEXT    NOT NULL,
    algorithm          TEXT    NOT NULL,
    payload            BLOB    NOT NULL,
    original_size      INTEGER NOT NULL,
    compressed_size    INTEGER NOT NULL,
    compressed_at      INTEGER NOT NULL,
    original_timestamp INTEGER NOT NULL,
    PRIMARY KEY (record_type, id)
);
CREATE INDEX IF NOT EXISTS idx_compressed_timestamp ON compressed_data(original_timestamp);

CREATE TABLE IF NOT EXISTS compression_log (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    record_type        TEXT    NOT NULL,
    records_compressed INTEGER NOT NULL,
    space_saved_bytes  INTEGER NOT NULL,
    duration_ms        INTEGER NOT NULL,
    ran_at             INTEGER NOT NULL
);
"#;

pub async fn migrate(pool: &SqlitePool) -> PersistResult<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}
