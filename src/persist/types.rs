use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::FeedError;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("event writer has shut down")]
    WriterClosed,
}

pub type PersistResult<T> = Result<T, PersistError>;

impl From<serde_json::Error> for PersistError {
    fn from(e: serde_json::Error) -> Self {
        PersistError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for PersistError {
    fn from(e: bincode::Error) -> Self {
        PersistError::Serialization(e.to_string())
    }
}

impl From<csv::Error> for PersistError {
    fn from(e: csv::Error) -> Self {
        PersistError::Serialization(e.to_string())
    }
}

impl From<PersistError> for FeedError {
    fn from(e: PersistError) -> Self {
        FeedError::Storage(e.to_string())
    }
}

pub(crate) fn datetime_from_ms(ms: i64) -> PersistResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| PersistError::Serialization(format!("timestamp {ms} out of range")))
}

/// Domain actions recorded for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    OrderPlaced {
        order_id: String,
        symbol: String,
        side: String,
        quantity: f64,
        price: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    OrderFilled {
        order_id: String,
        fill_price: f64,
        filled_quantity: f64,
        timestamp: DateTime<Utc>,
    },
    OrderCancelled {
        order_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    PositionOpened {
        position_id: String,
        symbol: String,
        quantity: f64,
        entry_price: f64,
        timestamp: DateTime<Utc>,
    },
    PositionClosed {
        position_id: String,
        exit_price: f64,
        pnl: f64,
        timestamp: DateTime<Utc>,
    },
    BalanceChanged {
        wallet: String,
        token: String,
        old_balance: f64,
        new_balance: f64,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    SettingChanged {
        key: String,
        old_value: String,
        new_value: String,
        timestamp: DateTime<Utc>,
    },
    WalletConnected {
        wallet_address: String,
        wallet_type: String,
        timestamp: DateTime<Utc>,
    },
    WalletDisconnected {
        wallet_address: String,
        timestamp: DateTime<Utc>,
    },
    TradeExecuted {
        trade_id: String,
        from_token: String,
        to_token: String,
        from_amount: f64,
        to_amount: f64,
        price: f64,
        timestamp: DateTime<Utc>,
    },
    ConnectionStateChanged {
        provider: String,
        state: String,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::OrderPlaced { .. } => "order_placed",
            DomainEvent::OrderFilled { .. } => "order_filled",
            DomainEvent::OrderCancelled { .. } => "order_cancelled",
            DomainEvent::PositionOpened { .. } => "position_opened",
            DomainEvent::PositionClosed { .. } => "position_closed",
            DomainEvent::BalanceChanged { .. } => "balance_changed",
            DomainEvent::SettingChanged { .. } => "setting_changed",
            DomainEvent::WalletConnected { .. } => "wallet_connected",
            DomainEvent::WalletDisconnected { .. } => "wallet_disconnected",
            DomainEvent::TradeExecuted { .. } => "trade_executed",
            DomainEvent::ConnectionStateChanged { .. } => "connection_state_changed",
        }
    }

    /// One line for humans, used by the CSV export.
    pub fn description(&self) -> String {
        match self {
            DomainEvent::OrderPlaced { order_id, symbol, side, quantity, price, .. } => {
                let at = price.map(|p| p.to_string()).unwrap_or_else(|| "market price".to_string());
                format!("Order {order_id} placed: {side} {quantity} {symbol} at {at}")
            }
            DomainEvent::OrderFilled { order_id, fill_price, filled_quantity, .. } => {
                format!("Order {order_id} filled: {filled_quantity} units at {fill_price}")
            }
            DomainEvent::OrderCancelled { order_id, reason, .. } => format!("Order {order_id} cancelled: {reason}"),
            DomainEvent::PositionOpened { position_id, symbol, quantity, entry_price, .. } => {
                format!("Position {position_id} opened: {quantity} {symbol} at {entry_price}")
            }
            DomainEvent::PositionClosed { position_id, exit_price, pnl, .. } => {
                format!("Position {position_id} closed at {exit_price} (P&L: {pnl})")
            }
            DomainEvent::BalanceChanged { wallet, token, old_balance, new_balance, reason, .. } => {
                format!("Balance changed for {wallet} {token}: {old_balance} -> {new_balance} ({reason})")
            }
            DomainEvent::SettingChanged { key, old_value, new_value, .. } => {
                format!("Setting '{key}' changed: {old_value} -> {new_value}")
            }
            DomainEvent::WalletConnected { wallet_address, wallet_type, .. } => {
                format!("Wallet {wallet_address} ({wallet_type}) connected")
            }
            DomainEvent::WalletDisconnected { wallet_address, .. } => format!("Wallet {wallet_address} disconnected"),
            DomainEvent::TradeExecuted { trade_id, from_token, to_token, from_amount, to_amount, .. } => {
                format!("Trade {trade_id}: {from_amount} {from_token} -> {to_amount} {to_token}")
            }
            DomainEvent::ConnectionStateChanged { provider, state, reason, .. } => match reason {
                Some(reason) => format!("{provider} stream {state}: {reason}"),
                None => format!("{provider} stream {state}"),
            },
        }
    }
}

/// An appended, immutable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: DomainEvent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    pub aggregate_id: Option<String>,
    pub event_type: Option<String>,
    pub from_time: Option<DateTime<Utc>>,
    pub to_time: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl EventFilter {
    pub fn aggregate(aggregate_id: impl Into<String>) -> Self {
        Self { aggregate_id: Some(aggregate_id.into()), ..Default::default() }
    }

    pub fn validate(&self) -> PersistResult<()> {
        if self.limit.is_some_and(|l| l < 0) || self.offset.is_some_and(|o| o < 0) {
            return Err(PersistError::InvalidFilter("limit and offset must be non-negative".into()));
        }
        if let (Some(from), Some(to)) = (self.from_time, self.to_time) {
            if from > to {
                return Err(PersistError::InvalidFilter(format!("from_time {from} is after to_time {to}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl std::str::FromStr for ExportFormat {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(PersistError::InvalidFilter(format!("unsupported export format {other}"))),
        }
    }
}

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Materialized state of one aggregate at `sequence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotData {
    pub version: u32,
    pub aggregate_id: String,
    pub sequence: u64,
    pub timestamp: i64,
    pub state: AggregateState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub price: Option<f64>,
    pub filled_quantity: f64,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub pnl: Option<f64>,
}

/// Fold of an aggregate's events. Plain maps and unit enums only, so it
/// survives the non-self-describing bincode snapshot blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    pub aggregate_id: String,
    pub sequence: u64,
    pub event_count: u64,
    pub last_event_ms: Option<i64>,
    pub orders: BTreeMap<String, OrderState>,
    pub positions: BTreeMap<String, PositionState>,
    /// Keyed by `wallet:token`.
    pub balances: BTreeMap<String, f64>,
    pub settings: BTreeMap<String, String>,
    /// Connected wallets and their type.
    pub wallets: BTreeMap<String, String>,
    pub trades_executed: u64,
    pub realized_pnl: f64,
    pub connection_state: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    #[test]
    fn test_payload_tagged_by_type() {
        let event = DomainEvent::OrderCancelled { order_id: "o-1".into(), reason: "user".into(), timestamp: ts() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "order_cancelled");
        assert_eq!(json["type"], event.event_type());
        let back: DomainEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_descriptions() {
        let placed = DomainEvent::OrderPlaced {
            order_id: "o-1".into(),
            symbol: "SOL".into(),
            side: "buy".into(),
            quantity: 2.0,
            price: None,
            timestamp: ts(),
        };
        assert_eq!(placed.description(), "Order o-1 placed: buy 2 SOL at market price");

        let state = DomainEvent::ConnectionStateChanged {
            provider: "birdeye".into(),
            state: "fallback".into(),
            reason: Some("3 failures".into()),
            timestamp: ts(),
        };
        assert_eq!(state.description(), "birdeye stream fallback: 3 failures");
    }

    #[test]
    fn test_filter_validation() {
        assert!(EventFilter::aggregate("A").validate().is_ok());
        let negative = EventFilter { limit: Some(-1), ..Default::default() };
        assert!(matches!(negative.validate(), Err(PersistError::InvalidFilter(_))));
        let inverted = EventFilter {
            from_time: Some(ts()),
            to_time: Some(ts() - chrono::Duration::seconds(1)),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_export_format_parse() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_storage_error_maps_to_feed_error() {
        let err: FeedError = PersistError::WriterClosed.into();
        assert_eq!(err, FeedError::Storage("event writer has shut down".into()));
    }
}
