//! Pure conversions between events, `AggregateState` and snapshot blobs.
//!
//! This file MUST NOT talk to the database.

use crate::persist::types::{
    AggregateState, DomainEvent, Event, OrderState, OrderStatus, PersistError, PersistResult, PositionState,
    SnapshotData, SNAPSHOT_SCHEMA_VERSION,
};

/// Apply a single event on top of `state`.
pub fn apply_event(state: &mut AggregateState, event: &Event) {
    if state.aggregate_id.is_empty() {
        state.aggregate_id = event.aggregate_id.clone();
    }
    state.sequence = event.sequence;
    state.event_count += 1;
    state.last_event_ms = Some(event.timestamp.timestamp_millis());

    match &event.payload {
        DomainEvent::OrderPlaced { order_id, symbol, side, quantity, price, .. } => {
            state.orders.insert(
                order_id.clone(),
                OrderState {
                    symbol: symbol.clone(),
                    side: side.clone(),
                    quantity: *quantity,
                    price: *price,
                    filled_quantity: 0.0,
                    status: OrderStatus::Open,
                },
            );
        }
        DomainEvent::OrderFilled { order_id, filled_quantity, .. } => {
            if let Some(order) = state.orders.get_mut(order_id) {
                order.filled_quantity += filled_quantity;
                if order.filled_quantity >= order.quantity {
                    order.status = OrderStatus::Filled;
                }
            }
        }
        DomainEvent::OrderCancelled { order_id, .. } => {
            if let Some(order) = state.orders.get_mut(order_id) {
                order.status = OrderStatus::Cancelled;
            }
        }
        DomainEvent::PositionOpened { position_id, symbol, quantity, entry_price, .. } => {
            state.positions.insert(
                position_id.clone(),
                PositionState {
                    symbol: symbol.clone(),
                    quantity: *quantity,
                    entry_price: *entry_price,
                    exit_price: None,
                    pnl: None,
                },
            );
        }
        DomainEvent::PositionClosed { position_id, exit_price, pnl, .. } => {
            if let Some(position) = state.positions.get_mut(position_id) {
                position.exit_price = Some(*exit_price);
                position.pnl = Some(*pnl);
            }
            state.realized_pnl += pnl;
        }
        DomainEvent::BalanceChanged { wallet, token, new_balance, .. } => {
            state.balances.insert(format!("{wallet}:{token}"), *new_balance);
        }
        DomainEvent::SettingChanged { key, new_value, .. } => {
            state.settings.insert(key.clone(), new_value.clone());
        }
        DomainEvent::WalletConnected { wallet_address, wallet_type, .. } => {
            state.wallets.insert(wallet_address.clone(), wallet_type.clone());
        }
        DomainEvent::WalletDisconnected { wallet_address, .. } => {
            state.wallets.remove(wallet_address);
        }
        DomainEvent::TradeExecuted { .. } => state.trades_executed += 1,
        DomainEvent::ConnectionStateChanged { state: conn, .. } => {
            state.connection_state = Some(conn.clone());
        }
    }
}

/// Fold `events` (already in sequence order) onto `base`.
pub fn fold<'a>(base: AggregateState, events: impl IntoIterator<Item = &'a Event>) -> AggregateState {
    events.into_iter().fold(base, |mut state, event| {
        apply_event(&mut state, event);
        state
    })
}

pub fn snapshot_of(state: &AggregateState, aggregate_id: &str, timestamp: i64) -> SnapshotData {
    SnapshotData {
        version: SNAPSHOT_SCHEMA_VERSION,
        aggregate_id: aggregate_id.to_string(),
        sequence: state.sequence,
        timestamp,
        state: state.clone(),
    }
}

pub fn encode_state(state: &AggregateState) -> PersistResult<Vec<u8>> {
    Ok(bincode::serialize(state)?)
}

pub fn decode_state(version: u32, blob: &[u8]) -> PersistResult<AggregateState> {
    if version != SNAPSHOT_SCHEMA_VERSION {
        return Err(PersistError::Serialization(format!(
            "snapshot schema {version}, expected {SNAPSHOT_SCHEMA_VERSION}"
        )));
    }
    Ok(bincode::deserialize(blob)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn event(seq: u64, payload: DomainEvent) -> Event {
        Event {
            id: Uuid::now_v7(),
            aggregate_id: "wallet-1".into(),
            event_type: payload.event_type().into(),
            sequence: seq,
            timestamp: Utc.timestamp_millis_opt(1_000 * seq as i64).unwrap(),
            payload,
        }
    }

    fn history() -> Vec<Event> {
        let t = Utc.timestamp_millis_opt(0).unwrap();
        vec![
            event(1, DomainEvent::OrderPlaced {
                order_id: "o1".into(),
                symbol: "SOL".into(),
                side: "buy".into(),
                quantity: 2.0,
                price: Some(140.0),
                timestamp: t,
            }),
            event(2, DomainEvent::OrderFilled { order_id: "o1".into(), fill_price: 140.0, filled_quantity: 2.0, timestamp: t }),
            event(3, DomainEvent::PositionOpened {
                position_id: "p1".into(),
                symbol: "SOL".into(),
                quantity: 2.0,
                entry_price: 140.0,
                timestamp: t,
            }),
            event(4, DomainEvent::PositionClosed { position_id: "p1".into(), exit_price: 150.0, pnl: 20.0, timestamp: t }),
            event(5, DomainEvent::BalanceChanged {
                wallet: "w".into(),
                token: "USDC".into(),
                old_balance: 0.0,
                new_balance: 20.0,
                reason: "pnl".into(),
                timestamp: t,
            }),
        ]
    }

    #[test]
    fn test_fold_tracks_orders_and_positions() {
        let state = fold(AggregateState::default(), &history());
        assert_eq!(state.aggregate_id, "wallet-1");
        assert_eq!(state.sequence, 5);
        assert_eq!(state.event_count, 5);
        assert_eq!(state.orders["o1"].status, OrderStatus::Filled);
        assert_eq!(state.positions["p1"].pnl, Some(20.0));
        assert_eq!(state.realized_pnl, 20.0);
        assert_eq!(state.balances["w:USDC"], 20.0);
        assert_eq!(state.last_event_ms, Some(5_000));
    }

    #[test]
    fn test_fold_from_midpoint_matches_full_fold() {
        let events = history();
        let full = fold(AggregateState::default(), &events);
        let mid = fold(AggregateState::default(), &events[..2]);
        let resumed = fold(mid, &events[2..]);
        assert_eq!(resumed, full);
    }

    #[test]
    fn test_blob_encoding() {
        let state = fold(AggregateState::default(), &history());
        let blob = encode_state(&state).unwrap();
        assert_eq!(decode_state(SNAPSHOT_SCHEMA_VERSION, &blob).unwrap(), state);
        assert!(decode_state(SNAPSHOT_SCHEMA_VERSION + 1, &blob).is_err());
    }
}
