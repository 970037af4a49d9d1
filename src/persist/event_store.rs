//! Append-only audit log over SQLite.
//!
//! All appends go through one writer task so per-aggregate sequences are
//! strictly increasing no matter how many producers call `append`
//! concurrently. Reads hit the pool directly.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::persist::snapshot::{fold, snapshot_of};
use crate::persist::sqlite::SqliteSnapshotStore;
use crate::persist::types::{
    datetime_from_ms, AggregateState, DomainEvent, Event, EventFilter, ExportFormat, PersistError, PersistResult,
    SnapshotData,
};
use crate::persist::{export, schema, SnapshotStore};
use crate::telemetry;

const PROJECTION_TTL_MS: i64 = 5 * 60 * 1000;
const PROJECTION_CAPACITY: usize = 100;
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStoreConfig {
    pub database_url: String,
    /// Automatic snapshot every N events per aggregate; 0 disables.
    pub snapshot_interval: u64,
    pub append_buffer: usize,
    pub max_connections: u32,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://mdfeed.db".to_string(),
            snapshot_interval: 1_000,
            append_buffer: 1_024,
            max_connections: 4,
        }
    }
}

impl EventStoreConfig {
    pub fn in_memory() -> Self {
        Self { database_url: "sqlite::memory:".to_string(), ..Default::default() }
    }

    fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}

enum WriteOp {
    Append {
        aggregate_id: String,
        payload: DomainEvent,
        reply: oneshot::Sender<PersistResult<Event>>,
    },
    Snapshot {
        aggregate_id: String,
        state: AggregateState,
        reply: oneshot::Sender<PersistResult<SnapshotData>>,
    },
}

/// Totals over the whole log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventStats {
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    /// Events stamped within the last 24 hours of the store clock.
    pub last_24h: u64,
}

pub struct EventStore {
    pool: SqlitePool,
    writer: mpsc::Sender<WriteOp>,
    snapshots: SqliteSnapshotStore,
    projections: Mutex<HashMap<(String, i64), (i64, AggregateState)>>,
    clock: Arc<dyn Clock>,
}

impl EventStore {
    #[instrument(skip(clock), fields(url = %config.database_url))]
    pub async fn open(config: &EventStoreConfig, clock: Arc<dyn Clock>) -> PersistResult<Self> {
        let in_memory = config.is_in_memory();
        let mut options = SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // every connection to :memory: is its own database
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections.max(1))
                .acquire_timeout(Duration::from_secs(3))
                .connect_with(options)
                .await?
        };

        schema::migrate(&pool).await?;
        let counters = load_sequence_counters(&pool).await?;
        info!(aggregates = counters.len(), "event store opened");

        let snapshots = SqliteSnapshotStore::new(pool.clone());
        let (tx, rx) = mpsc::channel(config.append_buffer.max(1));
        let writer = Writer {
            pool: pool.clone(),
            snapshots: snapshots.clone(),
            counters,
            snapshot_interval: config.snapshot_interval,
            clock: Arc::clone(&clock),
        };
        tokio::spawn(writer.run(rx));

        Ok(Self { pool, writer: tx, snapshots, projections: Mutex::new(HashMap::new()), clock })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append `payload` to `aggregate_id`. Returns the stored event with its
    /// id and sequence.
    pub async fn append(&self, aggregate_id: &str, payload: DomainEvent) -> PersistResult<Event> {
        let (reply, rx) = oneshot::channel();
        let op = WriteOp::Append { aggregate_id: aggregate_id.to_string(), payload, reply };
        self.writer.send(op).await.map_err(|_| PersistError::WriterClosed)?;
        rx.await.map_err(|_| PersistError::WriterClosed)?
    }

    /// Events matching `filter`, in append order.
    pub async fn query(&self, filter: &EventFilter) -> PersistResult<Vec<Event>> {
        filter.validate()?;
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, event_type, aggregate_id, sequence, timestamp, event_data FROM events WHERE 1=1",
        );
        push_conditions(&mut qb, filter);
        qb.push(" ORDER BY position ASC");
        match (filter.limit, filter.offset) {
            (Some(limit), offset) => {
                qb.push(" LIMIT ").push_bind(limit);
                if let Some(offset) = offset {
                    qb.push(" OFFSET ").push_bind(offset);
                }
            }
            (None, Some(offset)) => {
                qb.push(" LIMIT -1 OFFSET ").push_bind(offset);
            }
            (None, None) => {}
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn count(&self, filter: &EventFilter) -> PersistResult<u64> {
        filter.validate()?;
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM events WHERE 1=1");
        push_conditions(&mut qb, filter);
        let count = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    pub async fn stats(&self) -> PersistResult<EventStats> {
        let rows = sqlx::query("SELECT event_type, COUNT(*) AS n FROM events GROUP BY event_type")
            .fetch_all(&self.pool)
            .await?;
        let mut by_type = BTreeMap::new();
        for row in rows {
            let n: i64 = row.try_get("n")?;
            by_type.insert(row.try_get::<String, _>("event_type")?, n as u64);
        }
        let since = self.clock.now_ms() - DAY_MS;
        let last_24h: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE timestamp >= ?1")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(EventStats { total: by_type.values().sum(), by_type, last_24h: last_24h as u64 })
    }

    /// Every event of `aggregate_id` in sequence order.
    pub async fn replay(&self, aggregate_id: &str) -> PersistResult<Vec<Event>> {
        fetch_events(&self.pool, aggregate_id, 0, None).await
    }

    /// The prefix of `aggregate_id`'s history with `timestamp <= at`.
    pub async fn state_at(&self, aggregate_id: &str, at: DateTime<Utc>) -> PersistResult<Vec<Event>> {
        fetch_events(&self.pool, aggregate_id, 0, Some(at.timestamp_millis())).await
    }

    /// Record `state` as the snapshot of `aggregate_id` at its current sequence.
    pub async fn snapshot(&self, aggregate_id: &str, state: AggregateState) -> PersistResult<SnapshotData> {
        let (reply, rx) = oneshot::channel();
        let op = WriteOp::Snapshot { aggregate_id: aggregate_id.to_string(), state, reply };
        self.writer.send(op).await.map_err(|_| PersistError::WriterClosed)?;
        rx.await.map_err(|_| PersistError::WriterClosed)?
    }

    pub async fn latest_snapshot(&self, aggregate_id: &str) -> PersistResult<Option<SnapshotData>> {
        self.snapshots.load_snapshot(aggregate_id, None).await
    }

    /// Current state: nearest snapshot plus the events after it.
    pub async fn load_state(&self, aggregate_id: &str) -> PersistResult<AggregateState> {
        fold_latest(&self.pool, &self.snapshots, aggregate_id, None).await
    }

    /// State as of `at`, cached for five minutes per `(aggregate, at)`.
    pub async fn project_state_at(&self, aggregate_id: &str, at: DateTime<Utc>) -> PersistResult<AggregateState> {
        let at_ms = at.timestamp_millis();
        let key = (aggregate_id.to_string(), at_ms);
        let now = self.clock.now_ms();
        let cached = self
            .projections
            .lock()
            .get(&key)
            .filter(|(cached_at, _)| now - cached_at < PROJECTION_TTL_MS)
            .map(|(_, state)| state.clone());
        if let Some(state) = cached {
            return Ok(state);
        }

        let state = fold_latest(&self.pool, &self.snapshots, aggregate_id, Some(at_ms)).await?;

        let mut projections = self.projections.lock();
        projections.insert(key, (now, state.clone()));
        if projections.len() > PROJECTION_CAPACITY {
            let oldest = projections.iter().min_by_key(|(_, (cached_at, _))| *cached_at).map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                projections.remove(&oldest);
            }
        }
        Ok(state)
    }

    pub async fn export(&self, filter: &EventFilter, format: ExportFormat) -> PersistResult<Vec<u8>> {
        let events = self.query(filter).await?;
        debug!(events = events.len(), ?format, "exporting audit log");
        export::render(&events, format)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

struct Writer {
    pool: SqlitePool,
    snapshots: SqliteSnapshotStore,
    counters: HashMap<String, u64>,
    snapshot_interval: u64,
    clock: Arc<dyn Clock>,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::Receiver<WriteOp>) {
        while let Some(op) = rx.recv().await {
            match op {
                WriteOp::Append { aggregate_id, payload, reply } => {
                    let result = self.append(aggregate_id, payload).await;
                    if let Err(e) = &result {
                        warn!(error = %e, "event append failed");
                    }
                    let _ = reply.send(result);
                }
                WriteOp::Snapshot { aggregate_id, state, reply } => {
                    let _ = reply.send(self.snapshot(&aggregate_id, state).await);
                }
            }
        }
        debug!("event writer stopped");
    }

    async fn append(&mut self, aggregate_id: String, payload: DomainEvent) -> PersistResult<Event> {
        let sequence = self.counters.get(&aggregate_id).copied().unwrap_or(0) + 1;
        let event = Event {
            id: Uuid::now_v7(),
            event_type: payload.event_type().to_string(),
            aggregate_id,
            sequence,
            timestamp: datetime_from_ms(self.clock.now_ms())?,
            payload,
        };

        sqlx::query(
            r#"
            INSERT INTO events (id, event_type, aggregate_id, sequence, timestamp, event_data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(event.id.to_string())
        .bind(&event.event_type)
        .bind(&event.aggregate_id)
        .bind(sequence as i64)
        .bind(event.timestamp.timestamp_millis())
        .bind(serde_json::to_string(&event.payload)?)
        .execute(&self.pool)
        .await?;

        self.counters.insert(event.aggregate_id.clone(), sequence);
        metrics::counter!(telemetry::EVENTS_APPENDED).increment(1);

        if self.snapshot_interval > 0 && sequence % self.snapshot_interval == 0 {
            // the append already succeeded; a failed snapshot only costs replay time
            if let Err(e) = self.auto_snapshot(&event.aggregate_id).await {
                warn!(aggregate = %event.aggregate_id, sequence, error = %e, "automatic snapshot failed");
            }
        }
        Ok(event)
    }

    async fn auto_snapshot(&self, aggregate_id: &str) -> PersistResult<()> {
        let state = fold_latest(&self.pool, &self.snapshots, aggregate_id, None).await?;
        let snapshot = snapshot_of(&state, aggregate_id, self.clock.now_ms());
        self.snapshots.save_snapshot(&snapshot).await?;
        debug!(aggregate = aggregate_id, sequence = snapshot.sequence, "automatic snapshot");
        Ok(())
    }

    async fn snapshot(&self, aggregate_id: &str, mut state: AggregateState) -> PersistResult<SnapshotData> {
        state.aggregate_id = aggregate_id.to_string();
        state.sequence = self.counters.get(aggregate_id).copied().unwrap_or(0);
        let snapshot = snapshot_of(&state, aggregate_id, self.clock.now_ms());
        self.snapshots.save_snapshot(&snapshot).await?;
        Ok(snapshot)
    }
}

async fn load_sequence_counters(pool: &SqlitePool) -> PersistResult<HashMap<String, u64>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT aggregate_id, MAX(sequence) FROM events GROUP BY aggregate_id")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id, seq)| (id, seq as u64)).collect())
}

fn push_conditions<'a>(qb: &mut QueryBuilder<'a, Sqlite>, filter: &'a EventFilter) {
    if let Some(aggregate_id) = &filter.aggregate_id {
        qb.push(" AND aggregate_id = ").push_bind(aggregate_id.as_str());
    }
    if let Some(event_type) = &filter.event_type {
        qb.push(" AND event_type = ").push_bind(event_type.as_str());
    }
    if let Some(from) = filter.from_time {
        qb.push(" AND timestamp >= ").push_bind(from.timestamp_millis());
    }
    if let Some(to) = filter.to_time {
        qb.push(" AND timestamp <= ").push_bind(to.timestamp_millis());
    }
}

async fn fetch_events(
    pool: &SqlitePool,
    aggregate_id: &str,
    after_sequence: u64,
    upto_ms: Option<i64>,
) -> PersistResult<Vec<Event>> {
    let rows = sqlx::query(
        r#"
        SELECT id, event_type, aggregate_id, sequence, timestamp, event_data
        FROM events
        WHERE aggregate_id = ?1 AND sequence > ?2 AND timestamp <= ?3
        ORDER BY sequence ASC
        "#,
    )
    .bind(aggregate_id)
    .bind(after_sequence as i64)
    .bind(upto_ms.unwrap_or(i64::MAX))
    .fetch_all(pool)
    .await?;
    rows.iter().map(event_from_row).collect()
}

async fn fold_latest(
    pool: &SqlitePool,
    snapshots: &SqliteSnapshotStore,
    aggregate_id: &str,
    at_ms: Option<i64>,
) -> PersistResult<AggregateState> {
    let (base, after) = match snapshots.load_snapshot(aggregate_id, at_ms).await? {
        Some(snapshot) => (snapshot.state, snapshot.sequence),
        None => (AggregateState { aggregate_id: aggregate_id.to_string(), ..Default::default() }, 0),
    };
    let events = fetch_events(pool, aggregate_id, after, at_ms).await?;
    Ok(fold(base, &events))
}

fn event_from_row(row: &SqliteRow) -> PersistResult<Event> {
    let id: String = row.try_get("id")?;
    let sequence: i64 = row.try_get("sequence")?;
    let data: String = row.try_get("event_data")?;
    Ok(Event {
        id: Uuid::parse_str(&id).map_err(|e| PersistError::Serialization(e.to_string()))?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_type: row.try_get("event_type")?,
        sequence: sequence as u64,
        timestamp: datetime_from_ms(row.try_get("timestamp")?)?,
        payload: serde_json::from_str(&data)?,
    })
}
