// Refcounted subscription set. Holds keys only; the owning connection turns
// a `SubscriptionFlush` into provider frames.
use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use tracing::debug;

pub const MAX_BATCH: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFlush {
    pub subscribe: Vec<Vec<String>>,
    pub unsubscribe: Vec<Vec<String>>,
}

impl SubscriptionFlush {
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    pub fn subscribed_keys(&self) -> usize {
        self.subscribe.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    refcounts: BTreeMap<String, u32>,
    // keys the provider currently believes we hold
    sent: BTreeSet<String>,
    max_batch: usize,
}

impl SubscriptionManager {
    pub fn new(max_batch: usize) -> Self {
        Self {
            refcounts: BTreeMap::new(),
            sent: BTreeSet::new(),
            max_batch: max_batch.max(1),
        }
    }

    /// Bump refcounts. Returns keys that became active (0 -> 1).
    pub fn subscribe(&mut self, keys: &[String]) -> Vec<String> {
        let mut added = Vec::new();
        for key in keys.iter().unique() {
            let count = self.refcounts.entry(key.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                added.push(key.clone());
            }
        }
        if !added.is_empty() {
            debug!(keys = ?added, "keys activated");
        }
        added
    }

    /// Drop refcounts; unknown keys are ignored. Returns keys that hit zero.
    pub fn unsubscribe(&mut self, keys: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        for key in keys.iter().unique() {
            if let Some(count) = self.refcounts.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    self.refcounts.remove(key);
                    removed.push(key.clone());
                }
            }
        }
        if !removed.is_empty() {
            debug!(keys = ?removed, "keys released");
        }
        removed
    }

    pub fn refcount(&self, key: &str) -> u32 {
        self.refcounts.get(key).copied().unwrap_or(0)
    }

    pub fn is_subscribed(&self, key: &str) -> bool {
        self.refcounts.contains_key(key)
    }

    pub fn active_keys(&self) -> Vec<String> {
        self.refcounts.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.refcounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refcounts.is_empty()
    }

    /// Net difference between the active set and what was last sent,
    /// chunked to `max_batch`. Marks the active set as sent.
    pub fn flush(&mut self) -> SubscriptionFlush {
        let to_sub: Vec<String> = self
            .refcounts
            .keys()
            .filter(|k| !self.sent.contains(*k))
            .cloned()
            .collect();
        let to_unsub: Vec<String> = self
            .sent
            .iter()
            .filter(|k| !self.refcounts.contains_key(*k))
            .cloned()
            .collect();
        self.sent = self.refcounts.keys().cloned().collect();
        SubscriptionFlush {
            subscribe: self.chunk(to_sub),
            unsubscribe: self.chunk(to_unsub),
        }
    }

    /// A new socket starts with no provider-side subscriptions.
    pub fn reset_sent(&mut self) {
        self.sent.clear();
    }

    fn chunk(&self, keys: Vec<String>) -> Vec<Vec<String>> {
        keys.chunks(self.max_batch).map(<[String]>::to_vec).collect()
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new(MAX_BATCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(ks: &[&str]) -> Vec<String> {
        ks.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_refcount_keeps_key_until_last_release() {
        let mut subs = SubscriptionManager::default();
        subs.subscribe(&keys(&["SOL"]));
        subs.subscribe(&keys(&["SOL"]));
        let first = subs.flush();
        assert_eq!(first.subscribe, vec![keys(&["SOL"])]);

        assert!(subs.unsubscribe(&keys(&["SOL"])).is_empty());
        assert!(subs.is_subscribed("SOL"));
        assert!(subs.flush().is_empty());

        assert_eq!(subs.unsubscribe(&keys(&["SOL"])), keys(&["SOL"]));
        let last = subs.flush();
        assert_eq!(last.unsubscribe, vec![keys(&["SOL"])]);
        assert!(last.subscribe.is_empty());
    }

    #[test]
    fn test_unknown_unsubscribe_never_goes_negative() {
        let mut subs = SubscriptionManager::default();
        assert!(subs.unsubscribe(&keys(&["BONK"])).is_empty());
        assert_eq!(subs.refcount("BONK"), 0);
        assert!(subs.flush().is_empty());
    }

    #[test]
    fn test_flush_sends_only_net_changes() {
        let mut subs = SubscriptionManager::default();
        subs.subscribe(&keys(&["A", "B"]));
        subs.flush();
        subs.subscribe(&keys(&["C"]));
        subs.unsubscribe(&keys(&["C"]));
        subs.unsubscribe(&keys(&["A"]));
        let flush = subs.flush();
        assert!(flush.subscribe.is_empty());
        assert_eq!(flush.unsubscribe, vec![keys(&["A"])]);
    }

    #[test]
    fn test_batches_respect_max_batch() {
        let mut subs = SubscriptionManager::new(100);
        let many: Vec<String> = (0..250).map(|i| format!("K{i:03}")).collect();
        subs.subscribe(&many);
        let flush = subs.flush();
        let sizes: Vec<usize> = flush.subscribe.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(flush.subscribed_keys(), 250);
    }

    #[test]
    fn test_reset_resends_full_set() {
        let mut subs = SubscriptionManager::default();
        subs.subscribe(&keys(&["SOL", "BONK"]));
        subs.flush();
        assert!(subs.flush().is_empty());
        subs.reset_sent();
        let again = subs.flush();
        assert_eq!(again.subscribe, vec![keys(&["BONK", "SOL"])]);
    }

    #[test]
    fn test_duplicate_keys_in_one_call_count_once() {
        let mut subs = SubscriptionManager::default();
        subs.subscribe(&keys(&["X", "X"]));
        assert_eq!(subs.refcount("X"), 1);
    }
}
