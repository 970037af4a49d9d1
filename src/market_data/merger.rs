//! Snapshot cache that rebuilds per-key state from a full snapshot plus a
//! strictly contiguous run of deltas.
//!
//! A delta is applied only when `delta.sequence == last_sequence + 1`. Any
//! other sequence leaves the stored state untouched and marks the key stale
//! until the next full snapshot arrives.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{FeedError, FeedResult};
use crate::market_data::wire::{DeltaMessage, PriceSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyStatus {
    Live,
    Stale,
}

#[derive(Debug)]
struct Slot {
    snapshot: Option<PriceSnapshot>,
    status: KeyStatus,
}

#[derive(Debug, Default)]
pub struct DeltaMerger {
    slots: RwLock<HashMap<String, Slot>>,
}

impl DeltaMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the key's state wholesale and clear staleness.
    pub fn apply_snapshot(&self, key: &str, mut snapshot: PriceSnapshot) -> PriceSnapshot {
        snapshot.key = key.to_string();
        let mut slots = self.slots.write();
        let slot = slots.entry(key.to_string()).or_insert(Slot { snapshot: None, status: KeyStatus::Live });
        if slot.status == KeyStatus::Stale {
            debug!(key, sequence = snapshot.sequence, "resynchronised from snapshot");
        }
        slot.status = KeyStatus::Live;
        slot.snapshot = Some(snapshot.clone());
        snapshot
    }

    /// Merge changed fields if the delta is the next in sequence.
    pub fn apply_delta(&self, key: &str, delta: &DeltaMessage, observed_at: i64) -> FeedResult<PriceSnapshot> {
        let mut slots = self.slots.write();
        let slot = slots.entry(key.to_string()).or_insert(Slot { snapshot: None, status: KeyStatus::Stale });

        // no successor exists past u64::MAX, so that is a gap as well
        let expected = slot.snapshot.as_ref().and_then(|s| s.sequence.checked_add(1));
        let snapshot = match (&mut slot.snapshot, slot.status, expected) {
            (Some(snapshot), KeyStatus::Live, Some(next)) if delta.sequence == next => snapshot,
            _ => {
                slot.status = KeyStatus::Stale;
                warn!(key, ?expected, actual = delta.sequence, "delta out of sequence, key marked stale");
                return Err(FeedError::SequenceGap {
                    key: key.to_string(),
                    expected: expected.unwrap_or_default(),
                    actual: delta.sequence,
                });
            }
        };

        for (field, value) in &delta.changed_fields {
            snapshot.fields.insert(field.clone(), value.clone());
        }
        snapshot.sequence = delta.sequence;
        snapshot.observed_at = observed_at;
        Ok(snapshot.clone())
    }

    /// Last stored state, stale or not.
    pub fn get(&self, key: &str) -> Option<PriceSnapshot> {
        self.slots.read().get(key).and_then(|s| s.snapshot.clone())
    }

    /// Stored state only while it can be trusted.
    pub fn get_live(&self, key: &str) -> Option<PriceSnapshot> {
        self.slots
            .read()
            .get(key)
            .filter(|s| s.status == KeyStatus::Live)
            .and_then(|s| s.snapshot.clone())
    }

    pub fn status(&self, key: &str) -> Option<KeyStatus> {
        self.slots.read().get(key).map(|s| s.status)
    }

    pub fn is_stale(&self, key: &str) -> bool {
        self.status(key) == Some(KeyStatus::Stale)
    }

    pub fn stale_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .slots
            .read()
            .iter()
            .filter(|(_, s)| s.status == KeyStatus::Stale)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn remove(&self, key: &str) -> Option<PriceSnapshot> {
        self.slots.write().remove(key).and_then(|s| s.snapshot)
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::wire::Fields;
    use proptest::prelude::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, f64)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), json!(v))).collect()
    }

    fn delta(key: &str, sequence: u64, pairs: &[(&str, f64)]) -> DeltaMessage {
        DeltaMessage { key: key.into(), sequence, changed_fields: fields(pairs) }
    }

    #[test]
    fn test_contiguous_deltas_merge() {
        let merger = DeltaMerger::new();
        merger.apply_snapshot("SOL", PriceSnapshot::new("SOL", fields(&[("price", 100.0), ("volume", 5.0)]), 10, 0));
        let merged = merger.apply_delta("SOL", &delta("SOL", 11, &[("price", 101.0)]), 1).unwrap();
        assert_eq!(merged.sequence, 11);
        assert_eq!(merged.fields, fields(&[("price", 101.0), ("volume", 5.0)]));
        assert_eq!(merger.get("SOL"), Some(merged));
    }

    #[test]
    fn test_gap_leaves_state_and_marks_stale() {
        let merger = DeltaMerger::new();
        let snap = merger.apply_snapshot("SOL", PriceSnapshot::new("SOL", fields(&[("price", 100.0)]), 10, 0));
        let err = merger.apply_delta("SOL", &delta("SOL", 12, &[("price", 150.0)]), 1).unwrap_err();
        assert_eq!(err, FeedError::SequenceGap { key: "SOL".into(), expected: 11, actual: 12 });
        assert_eq!(merger.get("SOL"), Some(snap));
        assert!(merger.is_stale("SOL"));
        assert_eq!(merger.get_live("SOL"), None);

        // next-in-line delta is still refused until a snapshot arrives
        assert!(merger.apply_delta("SOL", &delta("SOL", 11, &[("price", 1.0)]), 2).is_err());

        merger.apply_snapshot("SOL", PriceSnapshot::new("SOL", fields(&[("price", 152.0)]), 12, 3));
        assert_eq!(merger.status("SOL"), Some(KeyStatus::Live));
        assert!(merger.apply_delta("SOL", &delta("SOL", 13, &[("price", 153.0)]), 4).is_ok());
    }

    #[test]
    fn test_duplicate_and_old_deltas_are_rejected() {
        let merger = DeltaMerger::new();
        merger.apply_snapshot("A", PriceSnapshot::new("A", fields(&[("price", 1.0)]), 5, 0));
        assert!(merger.apply_delta("A", &delta("A", 5, &[("price", 2.0)]), 0).is_err());
        assert_eq!(merger.stale_keys(), vec!["A".to_string()]);
    }

    #[test]
    fn test_delta_before_any_snapshot_is_stale() {
        let merger = DeltaMerger::new();
        assert!(merger.apply_delta("NEW", &delta("NEW", 1, &[("price", 2.0)]), 0).is_err());
        assert!(merger.is_stale("NEW"));
        assert_eq!(merger.get("NEW"), None);
    }

    #[test]
    fn test_delta_after_max_sequence_is_a_gap() {
        let merger = DeltaMerger::new();
        let snap = merger.apply_snapshot("SOL", PriceSnapshot::new("SOL", fields(&[("price", 1.0)]), u64::MAX, 0));
        let err = merger.apply_delta("SOL", &delta("SOL", 0, &[("price", 2.0)]), 1).unwrap_err();
        assert!(matches!(err, FeedError::SequenceGap { actual: 0, .. }));
        assert!(merger.apply_delta("SOL", &delta("SOL", u64::MAX, &[("price", 2.0)]), 1).is_err());
        assert_eq!(merger.get("SOL"), Some(snap));
        assert!(merger.is_stale("SOL"));
    }

    proptest! {
        // applying valid deltas equals one snapshot carrying the final fields
        #[test]
        fn prop_delta_chain_equals_final_snapshot(
            base in proptest::collection::btree_map("[a-e]", -1.0e6f64..1.0e6, 1..5),
            changes in proptest::collection::vec(proptest::collection::btree_map("[a-g]", -1.0e6f64..1.0e6, 0..4), 0..20),
        ) {
            let merger = DeltaMerger::new();
            let base_fields: Fields = base.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            merger.apply_snapshot("K", PriceSnapshot::new("K", base_fields.clone(), 0, 0));

            let mut expected = base_fields;
            for (i, change) in changes.iter().enumerate() {
                let changed: Fields = change.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
                expected.extend(changed.clone());
                let d = DeltaMessage { key: "K".into(), sequence: i as u64 + 1, changed_fields: changed };
                prop_assert!(merger.apply_delta("K", &d, 0).is_ok());
            }

            let reference = DeltaMerger::new();
            reference.apply_snapshot("K", PriceSnapshot::new("K", expected, changes.len() as u64, 0));
            prop_assert_eq!(merger.get("K"), reference.get("K"));
        }
    }
}
