// Birdeye price stream: JSON frames, symbol-keyed, optional sequence numbers.
use serde_json::json;

use super::birdeye_types::{BirdeyeEnvelope, RESERVED_FIELDS};
use super::{with_query_param, WireCodec};
use crate::error::{FeedError, FeedResult};
use crate::market_data::wire::{DeltaMessage, Fields, PriceSnapshot, RawMessage, WireMessage};

#[derive(Debug, Default, Clone, Copy)]
pub struct BirdeyeCodec;

impl BirdeyeCodec {
    fn command(&self, kind: &str, keys: &[String]) -> String {
        json!({
            "type": kind,
            "data": {
                "channel": "prices",
                "symbols": keys
            }
        })
        .to_string()
    }

    fn split(&self, env: BirdeyeEnvelope) -> FeedResult<(String, Option<u64>, Fields)> {
        let data = env.data.unwrap_or_default();
        let key = env
            .key
            .or_else(|| str_field(&data, "symbol"))
            .or_else(|| str_field(&data, "address"))
            .ok_or_else(|| FeedError::Protocol(format!("{} message without symbol", env.kind)))?;
        let sequence = env
            .sequence
            .or_else(|| data.get("sequence").and_then(|v| v.as_u64()))
            .or_else(|| data.get("seq").and_then(|v| v.as_u64()));
        let fields: Fields = data
            .into_iter()
            .filter(|(k, _)| !RESERVED_FIELDS.contains(&k.as_str()))
            .collect();
        Ok((key, sequence, fields))
    }
}

fn str_field(data: &serde_json::Map<String, serde_json::Value>, name: &str) -> Option<String> {
    data.get(name).and_then(|v| v.as_str()).map(str::to_string)
}

impl WireCodec for BirdeyeCodec {
    fn id(&self) -> &'static str {
        "birdeye"
    }

    fn connect_url(&self, base: &str, api_key: Option<&str>) -> String {
        with_query_param(base, "x-api-key", api_key)
    }

    fn subscribe_frame(&self, keys: &[String]) -> String {
        self.command("subscribe", keys)
    }

    fn unsubscribe_frame(&self, keys: &[String]) -> String {
        self.command("unsubscribe", keys)
    }

    fn parse(&self, raw: &RawMessage, observed_at: i64) -> FeedResult<WireMessage> {
        // binary frames carry the same JSON document
        let env: BirdeyeEnvelope = match raw {
            RawMessage::Text(text) => serde_json::from_str(text)?,
            RawMessage::Binary(bytes) => serde_json::from_slice(bytes)?,
        };

        let kind = env.kind.clone();
        match kind.as_str() {
            "ping" => Ok(WireMessage::Ping),
            "pong" => Ok(WireMessage::Pong),
            "price" | "snapshot" => {
                let (key, sequence, fields) = self.split(env)?;
                Ok(WireMessage::Snapshot(PriceSnapshot::new(
                    key,
                    fields,
                    sequence.unwrap_or(0),
                    observed_at,
                )))
            }
            "delta" => {
                let (key, sequence, changed_fields) = self.split(env)?;
                let sequence = sequence
                    .ok_or_else(|| FeedError::Protocol(format!("delta for {key} without sequence")))?;
                Ok(WireMessage::Delta(DeltaMessage { key, sequence, changed_fields }))
            }
            kind if kind.ends_with("subscribed") || kind == "welcome" => Ok(WireMessage::Ack(kind.to_string())),
            other => Err(FeedError::Protocol(format!("unexpected birdeye message type `{other}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> RawMessage {
        RawMessage::Text(s.to_string())
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let frame = BirdeyeCodec.subscribe_frame(&["SOL".to_string(), "BONK".to_string()]);
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "subscribe");
        assert_eq!(v["data"]["channel"], "prices");
        assert_eq!(v["data"]["symbols"], json!(["SOL", "BONK"]));
    }

    #[test]
    fn test_price_message_is_snapshot() {
        let msg = BirdeyeCodec
            .parse(
                &text(r#"{"type":"price","data":{"symbol":"SOL","price":142.5,"change_24h":1.2,"volume_24h":9000.0}}"#),
                77,
            )
            .unwrap();
        match msg {
            WireMessage::Snapshot(s) => {
                assert_eq!(s.key, "SOL");
                assert_eq!(s.sequence, 0);
                assert_eq!(s.observed_at, 77);
                assert_eq!(s.price(), Some(142.5));
                assert!(!s.fields.contains_key("symbol"));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_generic_delta_with_payload() {
        let msg = BirdeyeCodec
            .parse(&text(r#"{"type":"delta","key":"SOL","sequence":8,"payload":{"price":143.0}}"#), 0)
            .unwrap();
        assert_eq!(
            msg,
            WireMessage::Delta(DeltaMessage {
                key: "SOL".into(),
                sequence: 8,
                changed_fields: [("price".to_string(), json!(143.0))].into_iter().collect(),
            })
        );
    }

    #[test]
    fn test_delta_without_sequence_is_protocol_error() {
        let err = BirdeyeCodec.parse(&text(r#"{"type":"delta","data":{"symbol":"SOL","price":1.0}}"#), 0);
        assert!(matches!(err, Err(FeedError::Protocol(_))));
    }

    #[test]
    fn test_malformed_frames_are_errors_not_panics() {
        assert!(matches!(BirdeyeCodec.parse(&text("{not json"), 0), Err(FeedError::Protocol(_))));
        assert!(matches!(BirdeyeCodec.parse(&text(r#"{"type":"mystery"}"#), 0), Err(FeedError::Protocol(_))));
        assert!(matches!(
            BirdeyeCodec.parse(&RawMessage::Binary(vec![0xff, 0x00]), 0),
            Err(FeedError::Protocol(_))
        ));
    }

    #[test]
    fn test_binary_json_and_heartbeats() {
        let raw = RawMessage::Binary(br#"{"type":"pong"}"#.to_vec());
        assert_eq!(BirdeyeCodec.parse(&raw, 0).unwrap(), WireMessage::Pong);
        assert_eq!(BirdeyeCodec.parse(&text(r#"{"type":"ping"}"#), 0).unwrap(), WireMessage::Ping);
    }

    #[test]
    fn test_connect_url_carries_api_key() {
        assert_eq!(
            BirdeyeCodec.connect_url("wss://public-api.birdeye.so/socket/solana", Some("k1")),
            "wss://public-api.birdeye.so/socket/solana?x-api-key=k1"
        );
    }
}
