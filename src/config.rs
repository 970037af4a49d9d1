use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config as ConfigLoader, Environment, File};
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::market_data::adapters::ProviderKind;
use crate::market_data::connection::{ConnectionSetup, StreamConfig};
use crate::market_data::fallback::FallbackConfig;
use crate::market_data::health::HealthConfig;
use crate::market_data::reconnect::BackoffConfig;
use crate::persist::{CompressionConfig, EventStoreConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub metrics_port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_filter: "info,sqlx=warn".into(), metrics_port: 9000 }
    }
}

/// Every tunable of the feed core, with defaults for all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// One connection per entry; the first is the primary.
    pub streams: Vec<StreamConfig>,
    pub backoff: BackoffConfig,
    pub health: HealthConfig,
    pub fallback: FallbackConfig,
    pub cache: CacheConfig,
    pub event_store: EventStoreConfig,
    pub compression: CompressionConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            streams: vec![
                StreamConfig::for_provider(ProviderKind::Birdeye),
                StreamConfig::for_provider(ProviderKind::Helius),
            ],
            backoff: BackoffConfig::default(),
            health: HealthConfig::default(),
            fallback: FallbackConfig::default(),
            cache: CacheConfig::default(),
            event_store: EventStoreConfig::default(),
            compression: CompressionConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Settings {
    /// Defaults, then `path` (or `./mdfeed.toml` if present), then
    /// `MDFEED_<SECTION>__<KEY>` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("mdfeed").required(false),
        };

        let settings: Settings = ConfigLoader::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("MDFEED")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.ttl.validate()?;
        if self.fallback.failure_threshold == 0 {
            anyhow::bail!("fallback.failure_threshold must be at least 1");
        }
        if !(0.0..1.0).contains(&self.backoff.jitter) {
            anyhow::bail!("backoff.jitter must be in [0, 1), got {}", self.backoff.jitter);
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            anyhow::bail!(
                "backoff.base_delay_ms ({}) exceeds backoff.max_delay_ms ({})",
                self.backoff.base_delay_ms,
                self.backoff.max_delay_ms
            );
        }
        if self.streams.is_empty() {
            anyhow::bail!("at least one stream must be configured");
        }
        for (idx, stream) in self.streams.iter().enumerate() {
            if stream.max_batch == 0 {
                anyhow::bail!("streams[{idx}].max_batch must be at least 1");
            }
            if self.streams[..idx].iter().any(|s| s.provider == stream.provider) {
                anyhow::bail!("streams[{idx}]: provider {:?} configured twice", stream.provider);
            }
        }
        self.compression.validate()?;
        Ok(())
    }

    pub fn stream(&self, provider: ProviderKind) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.provider == provider)
    }

    pub fn connection_setup(&self, stream: &StreamConfig) -> ConnectionSetup {
        ConnectionSetup {
            stream: stream.clone(),
            backoff: self.backoff.clone(),
            health: self.health.clone(),
            fallback_threshold: self.fallback.failure_threshold,
            permanent_cooldown: Duration::from_millis(self.fallback.permanent_cooldown_ms),
        }
    }
}
