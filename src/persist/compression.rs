//! Background compression of aged audit rows.
//!
//! Originals are never touched: compressed copies live in `compressed_data`
//! and are decoded on demand through a small expiring cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::persist::schema;
use crate::persist::types::{PersistError, PersistResult};
use crate::telemetry;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const DECOMPRESS_CACHE_CAPACITY: usize = 100;
const DECOMPRESS_CACHE_TTL_MS: i64 = 5 * 60 * 1000;
const STATS_CACHE_TTL_MS: i64 = 30 * 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Zstd,
    /// Copy without compressing.
    Stored,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Zstd => "zstd",
            Algorithm::Stored => "stored",
        }
    }

    fn parse(s: &str) -> PersistResult<Self> {
        match s {
            "zstd" => Ok(Algorithm::Zstd),
            "stored" => Ok(Algorithm::Stored),
            other => Err(PersistError::Compression(format!("unknown algorithm {other}"))),
        }
    }

    fn encode(&self, level: i32, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Algorithm::Zstd => zstd::encode_all(data, level),
            Algorithm::Stored => Ok(data.to_vec()),
        }
    }

    fn decode(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Algorithm::Zstd => zstd::decode_all(data),
            Algorithm::Stored => Ok(data.to_vec()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    Event,
    Order,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Event => "event",
            RecordType::Order => "order",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub event_age_days: u32,
    pub order_age_days: u32,
    pub algorithm: Algorithm,
    pub level: i32,
    pub batch_size: u32,
    pub run_interval_ms: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            event_age_days: 7,
            order_age_days: 30,
            algorithm: Algorithm::Zstd,
            level: 3,
            batch_size: 1_000,
            run_interval_ms: DAY_MS as u64,
        }
    }
}

impl CompressionConfig {
    pub fn validate(&self) -> PersistResult<()> {
        if self.algorithm == Algorithm::Zstd && !zstd::compression_level_range().contains(&self.level) {
            return Err(PersistError::Compression(format!("zstd level {} out of range", self.level)));
        }
        if self.batch_size == 0 {
            return Err(PersistError::Compression("batch_size must be at least 1".into()));
        }
        Ok(())
    }

    fn run_interval(&self) -> Duration {
        Duration::from_millis(self.run_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionRecord {
    pub record_id: String,
    pub record_type: String,
    pub algorithm: Algorithm,
    pub original_size: u64,
    pub compressed_size: u64,
    pub compressed_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompressionStats {
    pub records: u64,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
    /// Percentage of bytes saved.
    pub ratio: f64,
    pub space_saved: u64,
    pub runs: u64,
    pub last_run: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub events: u64,
    pub orders: u64,
}

struct PendingRow {
    id: String,
    data: Vec<u8>,
    original_timestamp: i64,
}

pub struct CompressionManager {
    pool: SqlitePool,
    config: RwLock<CompressionConfig>,
    clock: Arc<dyn Clock>,
    decompressed: Mutex<HashMap<String, (i64, Arc<Vec<u8>>)>>,
    stats_cache: Mutex<Option<(i64, CompressionStats)>>,
}

impl CompressionManager {
    pub async fn new(pool: SqlitePool, config: CompressionConfig, clock: Arc<dyn Clock>) -> PersistResult<Self> {
        config.validate()?;
        schema::migrate(&pool).await?;
        Ok(Self {
            pool,
            config: RwLock::new(config),
            clock,
            decompressed: Mutex::new(HashMap::new()),
            stats_cache: Mutex::new(None),
        })
    }

    pub fn config(&self) -> CompressionConfig {
        self.config.read().clone()
    }

    /// Swap the settings of a running manager. Later runs, and the
    /// scheduled job's next tick, pick them up.
    pub fn update_config(&self, config: CompressionConfig) -> PersistResult<()> {
        config.validate()?;
        info!(?config, "compression settings updated");
        *self.config.write() = config;
        Ok(())
    }

    /// Compress every event older than `days` that has no compressed copy yet.
    #[instrument(skip(self))]
    pub async fn compress_older_than(&self, days: u32) -> PersistResult<u64> {
        let cutoff = self.clock.now_ms() - i64::from(days) * DAY_MS;
        let batch_size = self.config.read().batch_size.max(1);
        let started = Instant::now();
        let mut total = 0u64;
        let mut saved = 0i64;

        loop {
            let rows = sqlx::query(
                r#"
                SELECT id, event_data, timestamp
                FROM events
                WHERE timestamp < ?1
                  AND id NOT IN (SELECT id FROM compressed_data WHERE record_type = 'event')
                ORDER BY position ASC
                LIMIT ?2
                "#,
            )
            .bind(cutoff)
            .bind(i64::from(batch_size))
            .fetch_all(&self.pool)
            .await?;

            let fetched = rows.len();
            let pending = rows
                .iter()
                .map(|row| -> PersistResult<PendingRow> {
                    Ok(PendingRow {
                        id: row.try_get("id")?,
                        data: row.try_get::<String, _>("event_data")?.into_bytes(),
                        original_timestamp: row.try_get("timestamp")?,
                    })
                })
                .collect::<PersistResult<Vec<_>>>()?;

            let (count, batch_saved) = self.compress_batch(RecordType::Event, pending).await?;
            total += count;
            saved += batch_saved;
            if fetched < batch_size as usize {
                break;
            }
        }

        self.log_run(RecordType::Event, total, saved, started.elapsed()).await?;
        Ok(total)
    }

    /// Compress closed orders older than `days` from the `orders` table, if
    /// the host application keeps one.
    #[instrument(skip(self))]
    pub async fn compress_closed_orders(&self, days: u32) -> PersistResult<u64> {
        let exists = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'orders'")
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(0);
        }

        let cutoff = self.clock.now_ms() - i64::from(days) * DAY_MS;
        let batch_size = self.config.read().batch_size.max(1);
        let started = Instant::now();
        let mut total = 0u64;
        let mut saved = 0i64;

        loop {
            let rows = sqlx::query(
                r#"
                SELECT id, created_at, data
                FROM orders
                WHERE status IN ('filled', 'cancelled', 'failed')
                  AND created_at < ?1
                  AND id NOT IN (SELECT id FROM compressed_data WHERE record_type = 'order')
                ORDER BY created_at ASC
                LIMIT ?2
                "#,
            )
            .bind(cutoff)
            .bind(i64::from(batch_size))
            .fetch_all(&self.pool)
            .await?;

            let fetched = rows.len();
            let pending = rows
                .iter()
                .map(|row| -> PersistResult<PendingRow> {
                    Ok(PendingRow {
                        id: row.try_get("id")?,
                        data: row.try_get::<String, _>("data")?.into_bytes(),
                        original_timestamp: row.try_get("created_at")?,
                    })
                })
                .collect::<PersistResult<Vec<_>>>()?;

            let (count, batch_saved) = self.compress_batch(RecordType::Order, pending).await?;
            total += count;
            saved += batch_saved;
            if fetched < batch_size as usize {
                break;
            }
        }

        self.log_run(RecordType::Order, total, saved, started.elapsed()).await?;
        Ok(total)
    }

    /// One pass over both record kinds using the configured ages.
    pub async fn run_once(&self) -> PersistResult<RunSummary> {
        let config = self.config();
        let events = self.compress_older_than(config.event_age_days).await?;
        let orders = self.compress_closed_orders(config.order_age_days).await?;
        info!(events, orders, "compression run finished");
        Ok(RunSummary { events, orders })
    }

    async fn compress_batch(&self, record_type: RecordType, rows: Vec<PendingRow>) -> PersistResult<(u64, i64)> {
        if rows.is_empty() {
            return Ok((0, 0));
        }
        let (algorithm, level) = {
            let config = self.config.read();
            (config.algorithm, config.level)
        };
        let encoded = tokio::task::spawn_blocking(move || {
            rows.into_iter()
                .map(|row| -> std::io::Result<(PendingRow, Vec<u8>)> {
                    let payload = algorithm.encode(level, &row.data)?;
                    Ok((row, payload))
                })
                .collect::<std::io::Result<Vec<_>>>()
        })
        .await
        .map_err(|e| PersistError::Compression(e.to_string()))?
        .map_err(|e| PersistError::Compression(e.to_string()))?;

        let now = self.clock.now_ms();
        let mut saved = 0i64;
        let mut tx = self.pool.begin().await?;
        for (row, payload) in &encoded {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO compressed_data
                    (id, record_type, algorithm, payload, original_size, compressed_size, compressed_at, original_timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(&row.id)
            .bind(record_type.as_str())
            .bind(algorithm.as_str())
            .bind(payload.as_slice())
            .bind(row.data.len() as i64)
            .bind(payload.len() as i64)
            .bind(now)
            .bind(row.original_timestamp)
            .execute(&mut *tx)
            .await?;
            saved += row.data.len() as i64 - payload.len() as i64;
        }
        tx.commit().await?;

        let count = encoded.len() as u64;
        *self.stats_cache.lock() = None;
        metrics::counter!(telemetry::RECORDS_COMPRESSED, "record_type" => record_type.as_str()).increment(count);
        debug!(record_type = record_type.as_str(), count, saved, "batch compressed");
        Ok((count, saved))
    }

    async fn log_run(&self, record_type: RecordType, records: u64, saved: i64, took: Duration) -> PersistResult<()> {
        if records == 0 {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO compression_log (record_type, records_compressed, space_saved_bytes, duration_ms, ran_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(record_type.as_str())
        .bind(records as i64)
        .bind(saved)
        .bind(took.as_millis() as i64)
        .bind(self.clock.now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Original bytes of a compressed record.
    pub async fn decompress(&self, id: &str) -> PersistResult<Vec<u8>> {
        let now = self.clock.now_ms();
        let cached = self
            .decompressed
            .lock()
            .get(id)
            .filter(|(cached_at, _)| now - cached_at < DECOMPRESS_CACHE_TTL_MS)
            .map(|(_, bytes)| Arc::clone(bytes));
        if let Some(bytes) = cached {
            return Ok(bytes.as_ref().clone());
        }

        let row = sqlx::query("SELECT algorithm, payload FROM compressed_data WHERE id = ?1 ORDER BY record_type LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PersistError::NotFound(format!("compressed record {id}")))?;
        let algorithm = Algorithm::parse(&row.try_get::<String, _>("algorithm")?)?;
        let payload: Vec<u8> = row.try_get("payload")?;

        let bytes = tokio::task::spawn_blocking(move || algorithm.decode(&payload))
            .await
            .map_err(|e| PersistError::Compression(e.to_string()))?
            .map_err(|e| PersistError::Compression(e.to_string()))?;

        let mut cache = self.decompressed.lock();
        cache.insert(id.to_string(), (now, Arc::new(bytes.clone())));
        if cache.len() > DECOMPRESS_CACHE_CAPACITY {
            let oldest = cache.iter().min_by_key(|(_, (at, _))| *at).map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                cache.remove(&oldest);
            }
        }
        Ok(bytes)
    }

    pub async fn record(&self, id: &str) -> PersistResult<Option<CompressionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, record_type, algorithm, original_size, compressed_size, compressed_at
            FROM compressed_data WHERE id = ?1 ORDER BY record_type LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let original_size: i64 = row.try_get("original_size")?;
        let compressed_size: i64 = row.try_get("compressed_size")?;
        Ok(Some(CompressionRecord {
            record_id: row.try_get("id")?,
            record_type: row.try_get("record_type")?,
            algorithm: Algorithm::parse(&row.try_get::<String, _>("algorithm")?)?,
            original_size: original_size as u64,
            compressed_size: compressed_size as u64,
            compressed_at: row.try_get("compressed_at")?,
        }))
    }

    /// Drop decompressed entries past their expiry. Returns how many went.
    pub fn cleanup_cache(&self) -> usize {
        let now = self.clock.now_ms();
        let mut cache = self.decompressed.lock();
        let before = cache.len();
        cache.retain(|_, (cached_at, _)| now - *cached_at < DECOMPRESS_CACHE_TTL_MS);
        before - cache.len()
    }

    pub fn cached_decompressions(&self) -> usize {
        self.decompressed.lock().len()
    }

    pub async fn stats(&self) -> PersistResult<CompressionStats> {
        let now = self.clock.now_ms();
        let cached = self
            .stats_cache
            .lock()
            .as_ref()
            .filter(|(cached_at, _)| now - cached_at < STATS_CACHE_TTL_MS)
            .map(|(_, stats)| stats.clone());
        if let Some(stats) = cached {
            return Ok(stats);
        }

        let (records, original, compressed): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(original_size), 0), COALESCE(SUM(compressed_size), 0) FROM compressed_data",
        )
        .fetch_one(&self.pool)
        .await?;
        let (runs, last_run): (i64, Option<i64>) = sqlx::query_as("SELECT COUNT(*), MAX(ran_at) FROM compression_log")
            .fetch_one(&self.pool)
            .await?;

        let space_saved = (original - compressed).max(0);
        let stats = CompressionStats {
            records: records as u64,
            original_bytes: original as u64,
            compressed_bytes: compressed as u64,
            ratio: if original > 0 { (original - compressed) as f64 / original as f64 * 100.0 } else { 0.0 },
            space_saved: space_saved as u64,
            runs: runs as u64,
            last_run,
        };
        *self.stats_cache.lock() = Some((now, stats.clone()));
        Ok(stats)
    }

    /// Run `run_once` every `run_interval_ms` until `token` is cancelled.
    /// A failed run is logged and retried at the next tick.
    pub fn spawn_scheduled(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = schedule(self.config.read().run_interval());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let (enabled, period) = {
                            let config = self.config.read();
                            (config.enabled, config.run_interval())
                        };
                        if period != ticker.period() {
                            debug!(?period, "compression interval changed");
                            ticker = schedule(period);
                        }
                        if !enabled {
                            continue;
                        }
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "compression run failed, retrying next interval");
                        }
                        self.cleanup_cache();
                    }
                }
            }
            debug!("compression job stopped");
        })
    }
}

fn schedule(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}
