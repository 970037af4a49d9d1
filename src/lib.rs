// Market-data ingestion core: streaming connections, fallback polling,
// delta merging, TTL cache and the audit event store.
pub mod clock;
pub mod config;
pub mod error;
pub mod telemetry;

pub mod cache;         // tiered per-type TTL cache
pub mod market_data;   // provider streams, merger, fallback, router
pub mod persist;       // event store + compression over sqlite
