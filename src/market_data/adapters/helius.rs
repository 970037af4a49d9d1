// Helius account stream: JSON-RPC 2.0 subscriptions keyed by account address.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{with_query_param, WireCodec};
use crate::error::{FeedError, FeedResult};
use crate::market_data::wire::{Fields, PriceSnapshot, RawMessage, WireMessage};

#[derive(Debug)]
pub struct HeliusCodec {
    next_id: AtomicU64,
}

impl Default for HeliusCodec {
    fn default() -> Self {
        Self { next_id: AtomicU64::new(1) }
    }
}

#[derive(Debug, Deserialize)]
struct RpcFrame {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<NotificationParams>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    #[serde(default)]
    subscription: Option<Value>,
    result: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl HeliusCodec {
    fn request(&self, method: &str, keys: &[String]) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": keys
        })
        .to_string()
    }

    fn notification(&self, params: NotificationParams, observed_at: i64) -> FeedResult<WireMessage> {
        let mut result = params.result;
        let key = match result.remove("account") {
            Some(Value::String(account)) => account,
            _ => match params.subscription {
                Some(Value::String(s)) => s,
                Some(Value::Number(n)) => n.to_string(),
                _ => return Err(FeedError::Protocol("notification without account or subscription".into())),
            },
        };
        // slot is the ordering key; some payloads nest it under context
        let slot = result
            .get("slot")
            .and_then(Value::as_u64)
            .or_else(|| result.get("context").and_then(|c| c.get("slot")).and_then(Value::as_u64))
            .unwrap_or(0);
        let fields: Fields = result.into_iter().collect();
        Ok(WireMessage::Snapshot(PriceSnapshot::new(key, fields, slot, observed_at)))
    }
}

impl WireCodec for HeliusCodec {
    fn id(&self) -> &'static str {
        "helius"
    }

    fn connect_url(&self, base: &str, api_key: Option<&str>) -> String {
        with_query_param(base, "api-key", api_key)
    }

    fn subscribe_frame(&self, keys: &[String]) -> String {
        self.request("accountSubscribe", keys)
    }

    fn unsubscribe_frame(&self, keys: &[String]) -> String {
        self.request("accountUnsubscribe", keys)
    }

    fn parse(&self, raw: &RawMessage, observed_at: i64) -> FeedResult<WireMessage> {
        let frame: RpcFrame = match raw {
            RawMessage::Text(text) => serde_json::from_str(text)?,
            RawMessage::Binary(bytes) => serde_json::from_slice(bytes)?,
        };

        if let Some(err) = frame.error {
            return Err(FeedError::Protocol(format!("rpc error {}: {}", err.code, err.message)));
        }

        match frame.method.as_deref() {
            Some("accountNotification") | Some("notification") => {
                let params = frame
                    .params
                    .ok_or_else(|| FeedError::Protocol("notification without params".into()))?;
                self.notification(params, observed_at)
            }
            Some("ping") => Ok(WireMessage::Ping),
            Some("pong") => Ok(WireMessage::Pong),
            Some(other) => Err(FeedError::Protocol(format!("unexpected helius method `{other}`"))),
            None => match frame.result {
                Some(result) => Ok(WireMessage::Ack(result.to_string())),
                None => Err(FeedError::Protocol("rpc frame without method or result".into())),
            },
        }
    }
}
