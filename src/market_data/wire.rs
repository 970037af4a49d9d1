// Canonical message model every provider is normalised into.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type Fields = BTreeMap<String, serde_json::Value>;

/// Frame as it came off the socket, before provider parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl RawMessage {
    pub fn len(&self) -> usize {
        match self {
            RawMessage::Text(t) => t.len(),
            RawMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Complete state for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub key: String,
    pub fields: Fields,
    pub sequence: u64,
    /// Epoch millis at which the core observed this state.
    pub observed_at: i64,
}

impl PriceSnapshot {
    pub fn new(key: impl Into<String>, fields: Fields, sequence: u64, observed_at: i64) -> Self {
        Self { key: key.into(), fields, sequence, observed_at }
    }

    pub fn price(&self) -> Option<f64> {
        self.fields.get("price").and_then(serde_json::Value::as_f64)
    }
}

/// Only the fields that changed since `sequence - 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaMessage {
    pub key: String,
    pub sequence: u64,
    pub changed_fields: Fields,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Snapshot(PriceSnapshot),
    Delta(DeltaMessage),
    Ping,
    Pong,
    /// Provider acknowledgement of a (un)subscribe request.
    Ack(String),
}

impl WireMessage {
    pub fn key(&self) -> Option<&str> {
        match self {
            WireMessage::Snapshot(s) => Some(&s.key),
            WireMessage::Delta(d) => Some(&d.key),
            _ => None,
        }
    }
}
