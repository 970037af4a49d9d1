use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CacheError;

pub const MIN_TTL_MS: u64 = 100;
pub const MAX_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    TokenPrice,
    TokenInfo,
    MarketData,
    TopCoins,
    TrendingCoins,
    History,
    UserData,
}

impl CacheType {
    pub const ALL: [CacheType; 7] = [
        CacheType::TokenPrice,
        CacheType::TokenInfo,
        CacheType::MarketData,
        CacheType::TopCoins,
        CacheType::TrendingCoins,
        CacheType::History,
        CacheType::UserData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::TokenPrice => "token_price",
            CacheType::TokenInfo => "token_info",
            CacheType::MarketData => "market_data",
            CacheType::TopCoins => "top_coins",
            CacheType::TrendingCoins => "trending_coins",
            CacheType::History => "history",
            CacheType::UserData => "user_data",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }

    // prices churn too fast to be worth a disk write
    pub fn persistable(&self) -> bool {
        !matches!(self, CacheType::TokenPrice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtlConfig {
    pub prices_ms: u64,
    /// Token metadata and market data.
    pub metadata_ms: u64,
    /// Historical and user data.
    pub history_ms: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            prices_ms: 1_000,
            metadata_ms: 60 * 60 * 1000,
            history_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl CacheTtlConfig {
    pub fn ttl_for(&self, cache_type: CacheType) -> u64 {
        match cache_type {
            CacheType::TokenPrice => self.prices_ms,
            CacheType::TokenInfo | CacheType::MarketData | CacheType::TopCoins | CacheType::TrendingCoins => {
                self.metadata_ms
            }
            CacheType::History | CacheType::UserData => self.history_ms,
        }
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        for (class, ttl_ms) in [("prices", self.prices_ms), ("metadata", self.metadata_ms), ("history", self.history_ms)] {
            if !(MIN_TTL_MS..=MAX_TTL_MS).contains(&ttl_ms) {
                return Err(CacheError::InvalidTtl { class, ttl_ms });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub cache_type: CacheType,
    pub inserted_at: i64,
    pub ttl_ms: u64,
    pub size_bytes: usize,
    pub last_accessed: i64,
    pub access_count: u64,
}

impl CacheEntry {
    pub fn new(key: &str, value: Value, cache_type: CacheType, now: i64, ttl_ms: u64) -> Self {
        let size_bytes = key.len() + value.to_string().len();
        Self {
            key: key.to_string(),
            value,
            cache_type,
            inserted_at: now,
            ttl_ms,
            size_bytes,
            last_accessed: now,
            access_count: 0,
        }
    }

    pub fn expires_at(&self) -> i64 {
        self.inserted_at.saturating_add(self.ttl_ms as i64)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TypeStats {
    pub hits: u64,
    pub misses: u64,
}

impl TypeStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size_bytes: usize,
    pub entries: usize,
    pub hit_rate: f64,
    pub warm_loads: u64,
    pub disk_hits: u64,
    pub disk_misses: u64,
    pub last_warmed: Option<i64>,
    pub per_type: BTreeMap<CacheType, TypeStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_ttls_by_class() {
        let ttl = CacheTtlConfig::default();
        assert_eq!(ttl.ttl_for(CacheType::TokenPrice), 1_000);
        assert_eq!(ttl.ttl_for(CacheType::MarketData), 3_600_000);
        assert_eq!(ttl.ttl_for(CacheType::TokenInfo), 3_600_000);
        assert_eq!(ttl.ttl_for(CacheType::History), 86_400_000);
        assert_eq!(ttl.ttl_for(CacheType::UserData), 86_400_000);
    }

    #[test]
    fn test_ttl_bounds_validated() {
        assert!(CacheTtlConfig::default().validate().is_ok());
        let too_short = CacheTtlConfig { prices_ms: 50, ..Default::default() };
        assert!(matches!(too_short.validate(), Err(CacheError::InvalidTtl { class: "prices", ttl_ms: 50 })));
        let too_long = CacheTtlConfig { history_ms: MAX_TTL_MS + 1, ..Default::default() };
        assert!(too_long.validate().is_err());
    }

    #[test]
    fn test_entry_expiry_boundary() {
        let entry = CacheEntry::new("SOL", json!(1.0), CacheType::TokenPrice, 1_000, 1_000);
        assert!(!entry.is_expired(1_999));
        assert!(entry.is_expired(2_000));
    }

    #[test]
    fn test_index_matches_all_order() {
        for (i, ty) in CacheType::ALL.iter().enumerate() {
            assert_eq!(ty.index(), i);
        }
    }
}
