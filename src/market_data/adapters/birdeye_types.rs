use serde::Deserialize;
use serde_json::{Map, Value};

// Inbound frame: {"type": "...", "key"?, "sequence"?, "data"|"payload": {...}}
#[derive(Debug, Deserialize)]
pub struct BirdeyeEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub sequence: Option<u64>,
    #[serde(default, alias = "payload")]
    pub data: Option<Map<String, Value>>,
}

// Fields that identify a message rather than describe the price
pub const RESERVED_FIELDS: [&str; 5] = ["symbol", "address", "key", "sequence", "seq"];
