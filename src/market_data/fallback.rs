//! REST polling that stands in for the stream while it cannot deliver.
//!
//! Inactive -> Active after `failure_threshold` consecutive connect failures
//! or a permanent failure. Active -> Inactive once the stream reports
//! `Connected` followed by `Resubscribed`. Results for keys released while a
//! request was in flight are dropped, never retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{FeedError, FeedResult};
use crate::market_data::connection::StreamEvent;
use crate::market_data::subscription::SubscriptionManager;
use crate::market_data::wire::{Fields, PriceSnapshot};
use crate::telemetry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub failure_threshold: u32,
    pub poll_interval_ms: u64,
    pub rest_url: String,
    pub request_timeout_ms: u64,
    pub permanent_cooldown_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            poll_interval_ms: 5_000,
            rest_url: "https://public-api.birdeye.so/defi/price".into(),
            request_timeout_ms: 10_000,
            permanent_cooldown_ms: 300_000,
        }
    }
}

impl FallbackConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Request/response source of full snapshots.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, key: &str) -> FeedResult<PriceSnapshot>;
}

pub struct RestFetcher {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    clock: Arc<dyn Clock>,
}

impl RestFetcher {
    pub fn new(config: &FallbackConfig, api_key: Option<String>, clock: Arc<dyn Clock>) -> FeedResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .gzip(true)
            .build()?;
        Ok(Self { client, url: config.rest_url.clone(), api_key, clock })
    }
}

#[async_trait]
impl SnapshotFetcher for RestFetcher {
    async fn fetch(&self, key: &str) -> FeedResult<PriceSnapshot> {
        let mut request = self.client.get(&self.url).query(&[("address", key)]);
        if let Some(api_key) = &self.api_key {
            request = request.header("X-API-KEY", api_key);
        }
        let body: Value = request.send().await?.error_for_status()?.json().await?;
        snapshot_from_rest(key, body, self.clock.now_ms())
    }
}

/// Normalise `{"success":..,"data":{..}}` (or a bare object) into a snapshot.
pub fn snapshot_from_rest(key: &str, body: Value, observed_at: i64) -> FeedResult<PriceSnapshot> {
    if body.get("success") == Some(&Value::Bool(false)) {
        return Err(FeedError::Protocol(format!("rest endpoint reported failure for {key}")));
    }
    let Value::Object(mut root) = body else {
        return Err(FeedError::Protocol(format!("rest response for {key} is not an object")));
    };
    let data = match root.remove("data") {
        Some(Value::Object(data)) => data,
        _ => root,
    };
    let mut fields: Fields = data
        .into_iter()
        .filter(|(k, _)| k != "success" && k != "symbol" && k != "address")
        .collect();
    if !fields.contains_key("price") {
        if let Some(value) = fields.remove("value") {
            fields.insert("price".into(), value);
        }
    }
    let sequence = fields.remove("sequence").and_then(|v| v.as_u64()).unwrap_or(0);
    Ok(PriceSnapshot::new(key, fields, sequence, observed_at))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FallbackState {
    Inactive,
    Active,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FallbackStatus {
    pub active: bool,
    pub reason: Option<String>,
    pub last_success: Option<i64>,
    pub interval_ms: u64,
    pub consecutive_failures: u32,
}

struct Inner {
    state: FallbackState,
    reason: Option<String>,
    consecutive_failures: u32,
    awaiting_resubscribe: bool,
    keys: SubscriptionManager,
    key_tokens: HashMap<String, CancellationToken>,
    cycle: Option<CancellationToken>,
    last_success: Option<i64>,
}

pub struct FallbackPoller {
    config: FallbackConfig,
    fetcher: Arc<dyn SnapshotFetcher>,
    out: mpsc::Sender<PriceSnapshot>,
    clock: Arc<dyn Clock>,
    root: CancellationToken,
    inner: Mutex<Inner>,
}

impl FallbackPoller {
    pub fn new(
        config: FallbackConfig,
        fetcher: Arc<dyn SnapshotFetcher>,
        out: mpsc::Sender<PriceSnapshot>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            fetcher,
            out,
            clock,
            root: CancellationToken::new(),
            inner: Mutex::new(Inner {
                state: FallbackState::Inactive,
                reason: None,
                consecutive_failures: 0,
                awaiting_resubscribe: false,
                keys: SubscriptionManager::default(),
                key_tokens: HashMap::new(),
                cycle: None,
                last_success: None,
            }),
        })
    }

    /// Drive the state machine from the stream's event feed. Returns the new
    /// state when a transition happened.
    pub fn on_stream_event(self: &Arc<Self>, event: &StreamEvent) -> Option<FallbackState> {
        match event {
            StreamEvent::Error(FeedError::Connection(_)) => {
                let failures = {
                    let mut inner = self.inner.lock();
                    inner.consecutive_failures += 1;
                    inner.consecutive_failures
                };
                if failures >= self.config.failure_threshold
                    && self.activate(format!("{failures} consecutive connection failures"))
                {
                    return Some(FallbackState::Active);
                }
                None
            }
            StreamEvent::PermanentFailure { attempts } => self
                .activate(format!("reconnect attempts exhausted after {attempts}"))
                .then_some(FallbackState::Active),
            StreamEvent::Connected => {
                let mut inner = self.inner.lock();
                inner.consecutive_failures = 0;
                if inner.state == FallbackState::Active {
                    inner.awaiting_resubscribe = true;
                }
                None
            }
            StreamEvent::Resubscribed { .. } => {
                let confirmed = {
                    let inner = self.inner.lock();
                    inner.state == FallbackState::Active && inner.awaiting_resubscribe
                };
                (confirmed && self.deactivate()).then_some(FallbackState::Inactive)
            }
            _ => None,
        }
    }

    /// Start polling. Returns false if already active.
    pub fn activate(self: &Arc<Self>, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let cycle = {
            let mut inner = self.inner.lock();
            if inner.state == FallbackState::Active {
                return false;
            }
            let cycle = self.root.child_token();
            inner.state = FallbackState::Active;
            inner.reason = Some(reason.clone());
            inner.awaiting_resubscribe = false;
            inner.cycle = Some(cycle.clone());
            cycle
        };
        metrics::gauge!(telemetry::FALLBACK_ACTIVE).set(1.0);
        warn!(%reason, interval_ms = self.config.poll_interval_ms, "fallback polling activated");
        tokio::spawn(Arc::clone(self).poll_loop(cycle));
        true
    }

    /// Stop polling. Returns false if already inactive.
    pub fn deactivate(&self) -> bool {
        let cycle = {
            let mut inner = self.inner.lock();
            if inner.state == FallbackState::Inactive {
                return false;
            }
            inner.state = FallbackState::Inactive;
            inner.reason = None;
            inner.awaiting_resubscribe = false;
            inner.cycle.take()
        };
        if let Some(cycle) = cycle {
            cycle.cancel();
        }
        metrics::gauge!(telemetry::FALLBACK_ACTIVE).set(0.0);
        info!("stream resumed, fallback polling deactivated");
        true
    }

    pub fn track(&self, keys: &[String]) {
        let mut inner = self.inner.lock();
        for key in inner.keys.subscribe(keys) {
            let token = self.root.child_token();
            inner.key_tokens.insert(key, token);
        }
    }

    /// Release keys; polls in flight for keys that hit zero are cancelled.
    pub fn untrack(&self, keys: &[String]) {
        let mut inner = self.inner.lock();
        for key in inner.keys.unsubscribe(keys) {
            if let Some(token) = inner.key_tokens.remove(&key) {
                token.cancel();
            }
        }
    }

    pub fn is_tracking(&self, key: &str) -> bool {
        self.inner.lock().keys.is_subscribed(key)
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().state == FallbackState::Active
    }

    pub fn state(&self) -> FallbackState {
        self.inner.lock().state
    }

    pub fn status(&self) -> FallbackStatus {
        let inner = self.inner.lock();
        FallbackStatus {
            active: inner.state == FallbackState::Active,
            reason: inner.reason.clone(),
            last_success: inner.last_success,
            interval_ms: self.config.poll_interval_ms,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// One round of requests, independent of the activation state.
    pub async fn poll_once(&self, keys: &[String]) -> Vec<(String, FeedResult<PriceSnapshot>)> {
        let requests = keys.iter().map(|key| async move { (key.clone(), self.fetcher.fetch(key).await) });
        futures::future::join_all(requests).await
    }

    pub fn shutdown(&self) {
        self.root.cancel();
    }

    async fn poll_loop(self: Arc<Self>, cycle: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cycle.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let targets: Vec<(String, CancellationToken)> = {
                let inner = self.inner.lock();
                inner.key_tokens.iter().map(|(k, t)| (k.clone(), t.clone())).collect()
            };
            if targets.is_empty() {
                continue;
            }
            debug!(keys = targets.len(), "fallback poll cycle");
            let polls = targets
                .into_iter()
                .map(|(key, token)| self.poll_key(key, token, &cycle));
            futures::future::join_all(polls).await;
        }
        debug!("fallback poll loop stopped");
    }

    async fn poll_key(&self, key: String, token: CancellationToken, cycle: &CancellationToken) {
        let result = tokio::select! {
            _ = token.cancelled() => {
                debug!(%key, "key released, poll cancelled");
                return;
            }
            _ = cycle.cancelled() => return,
            result = self.fetcher.fetch(&key) => result,
        };
        match result {
            Ok(snapshot) => {
                // the key may have been released while the request was out
                if token.is_cancelled() || cycle.is_cancelled() {
                    debug!(%key, "discarding poll result for released key");
                    return;
                }
                self.inner.lock().last_success = Some(self.clock.now_ms());
                if self.out.send(snapshot).await.is_err() {
                    debug!("fallback consumer has gone away");
                }
            }
            Err(e) => warn!(%key, error = %e, "fallback poll failed, will retry next cycle"),
        }
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
