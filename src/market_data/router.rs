//! Top-level owner of the feed core.
//!
//! `FeedRouter` builds every component once and wires them together. Each
//! configured provider gets its own feed: a connection task, a fallback
//! poller, a merger and an ingest pipeline, so one provider failing never
//! touches another. All feeds share the cache, the event store and one
//! broadcast of [`Update`]s. Connection state transitions are recorded in
//! the event store per provider.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheManager, CacheType};
use crate::clock::{self, Clock};
use crate::config::Settings;
use crate::error::{FeedError, FeedResult};
use crate::market_data::adapters::{ProviderKind, StreamProvider, WireCodec};
use crate::market_data::connection::{
    ConnectionState, StreamConfig, StreamConnection, StreamEvent, StreamHandle, StreamStatistics,
};
use crate::market_data::fallback::{FallbackConfig, FallbackPoller, FallbackStatus, RestFetcher, SnapshotFetcher};
use crate::market_data::merger::DeltaMerger;
use crate::market_data::queue::MessageQueue;
use crate::market_data::wire::{PriceSnapshot, WireMessage};
use crate::persist::{
    CompressionManager, DomainEvent, Event, EventFilter, EventStore, ExportFormat,
};
use crate::telemetry;

const UPDATE_BUFFER: usize = 1_024;
const RESYNC_BUFFER: usize = 64;

type Resync = (String, FeedResult<PriceSnapshot>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Stream,
    Fallback,
    /// One-shot REST snapshot after a sequence gap.
    Resync,
}

/// A merged snapshot published to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Update {
    pub provider: &'static str,
    pub key: String,
    pub snapshot: PriceSnapshot,
    pub source: UpdateSource,
}

pub type UpdateStream = BoxStream<'static, Update>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub provider: &'static str,
    pub state: ConnectionState,
    pub statistics: StreamStatistics,
    pub uptime_ms: u64,
    pub fallback: FallbackStatus,
    pub latency: LatencySummary,
}

/// Receive-to-broadcast latency of the pipeline, in microseconds.
struct LatencyTracker {
    histogram: Mutex<Option<Histogram<u64>>>,
}

impl LatencyTracker {
    fn new() -> Self {
        // 1us .. 60s at 3 significant figures
        Self { histogram: Mutex::new(Histogram::new_with_bounds(1, 60_000_000, 3).ok()) }
    }

    fn record(&self, started: Instant) {
        let us = started.elapsed().as_micros().min(u64::MAX as u128) as u64;
        if let Some(h) = self.histogram.lock().as_mut() {
            h.saturating_record(us.max(1));
        }
        metrics::histogram!(telemetry::PIPELINE_LATENCY).record(us as f64);
    }

    fn summary(&self) -> LatencySummary {
        match self.histogram.lock().as_ref() {
            Some(h) if !h.is_empty() => LatencySummary {
                samples: h.len(),
                p50_us: h.value_at_quantile(0.5),
                p99_us: h.value_at_quantile(0.99),
                max_us: h.max(),
            },
            _ => LatencySummary::default(),
        }
    }
}

/// One provider's connection and the pipeline that serves it.
struct Feed {
    kind: ProviderKind,
    handle: StreamHandle,
    pipeline: Arc<Pipeline>,
}

impl Feed {
    fn status(&self, now_ms: i64) -> StreamStatus {
        let statistics = self.handle.statistics();
        StreamStatus {
            provider: self.handle.provider(),
            state: self.handle.state(),
            uptime_ms: statistics.uptime_ms(now_ms),
            statistics,
            fallback: self.pipeline.poller.status(),
            latency: self.pipeline.latency.summary(),
        }
    }
}

pub struct FeedRouter {
    /// In configuration order; the first is the primary.
    feeds: Vec<Feed>,
    cache: Arc<CacheManager>,
    store: Arc<EventStore>,
    compression: Arc<CompressionManager>,
    updates: broadcast::Sender<Update>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FeedRouter {
    /// Start against the configured providers and REST endpoint.
    pub async fn start(settings: Settings) -> FeedResult<Self> {
        let clock = clock::system();
        let api_key = settings
            .stream(ProviderKind::Birdeye)
            .and_then(|stream| stream.api_key.clone());
        let fetcher = RestFetcher::new(&settings.fallback, api_key, Arc::clone(&clock))?;
        Self::start_with(settings, Arc::new(fetcher), clock).await
    }

    #[instrument(skip_all, fields(streams = settings.streams.len()))]
    pub async fn start_with(
        settings: Settings,
        fetcher: Arc<dyn SnapshotFetcher>,
        clock: Arc<dyn Clock>,
    ) -> FeedResult<Self> {
        if settings.streams.is_empty() {
            return Err(FeedError::Protocol("no streams configured".into()));
        }
        let store = Arc::new(EventStore::open(&settings.event_store, Arc::clone(&clock)).await?);
        let compression = Arc::new(
            CompressionManager::new(store.pool().clone(), settings.compression.clone(), Arc::clone(&clock)).await?,
        );
        let cache = Arc::new(CacheManager::new(settings.cache.clone(), Arc::clone(&clock))?);
        if settings.cache.disk_dir.is_some() {
            match cache.populate_from_disk(settings.cache.max_entries).await {
                Ok(loaded) => debug!(loaded, "cache warmed from disk"),
                Err(e) => warn!(error = %e, "could not warm cache from disk"),
            }
        }

        let cancel = CancellationToken::new();
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        let mut feeds = Vec::with_capacity(settings.streams.len());
        let mut tasks = Vec::new();

        for stream in &settings.streams {
            let (poll_tx, poll_rx) = mpsc::channel(stream.queue_capacity.max(1));
            let poller = FallbackPoller::new(settings.fallback.clone(), Arc::clone(&fetcher), poll_tx, Arc::clone(&clock));
            let provider = Arc::new(StreamProvider::new(stream.provider));
            let (handle, connection_task) = StreamConnection::spawn(
                settings.connection_setup(stream),
                Arc::clone(&provider),
                Arc::clone(&clock),
                cancel.child_token(),
            );
            let (pipeline, resync_rx) = Pipeline::new(
                provider,
                stream,
                &settings.fallback,
                Arc::clone(&poller),
                Arc::clone(&fetcher),
                Arc::clone(&cache),
                updates.clone(),
                Arc::clone(&clock),
            );

            tasks.push(connection_task);
            tasks.push(tokio::spawn(Arc::clone(&pipeline).run(
                handle.events(),
                poll_rx,
                resync_rx,
                cancel.child_token(),
            )));
            tasks.push(tokio::spawn(record_transitions(
                Arc::clone(&store),
                handle.provider(),
                handle.watch_state(),
                poller,
                Arc::clone(&clock),
                cancel.child_token(),
            )));
            info!(provider = handle.provider(), "stream feed started");
            feeds.push(Feed { kind: stream.provider, handle, pipeline });
        }

        if settings.compression.enabled {
            tasks.push(Arc::clone(&compression).spawn_scheduled(cancel.child_token()));
        }

        info!(feeds = feeds.len(), "feed router started");
        Ok(Self {
            feeds,
            cache,
            store,
            compression,
            updates,
            clock,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    fn feed(&self, provider: ProviderKind) -> FeedResult<&Feed> {
        self.feeds
            .iter()
            .find(|feed| feed.kind == provider)
            .ok_or_else(|| FeedError::Protocol(format!("no {provider:?} stream configured")))
    }

    fn primary(&self) -> ProviderKind {
        self.feeds.first().map(|feed| feed.kind).unwrap_or_default()
    }

    /// Subscribe to `keys` on the primary provider.
    pub async fn subscribe(&self, keys: Vec<String>) -> FeedResult<UpdateStream> {
        self.subscribe_on(self.primary(), keys).await
    }

    pub async fn subscribe_prices(&self, tokens: Vec<String>) -> FeedResult<UpdateStream> {
        self.subscribe_on(ProviderKind::Birdeye, tokens).await
    }

    pub async fn subscribe_wallets(&self, accounts: Vec<String>) -> FeedResult<UpdateStream> {
        self.subscribe_on(ProviderKind::Helius, accounts).await
    }

    /// Subscribe to `keys` on one provider and receive its merged updates
    /// for them.
    pub async fn subscribe_on(&self, provider: ProviderKind, keys: Vec<String>) -> FeedResult<UpdateStream> {
        if keys.is_empty() {
            return Err(FeedError::Protocol("subscribe needs at least one key".into()));
        }
        let feed = self.feed(provider)?;
        // attach before the provider can answer
        let rx = self.updates.subscribe();
        feed.handle.subscribe(keys.clone()).await?;
        feed.pipeline.poller.track(&keys);

        let source = feed.handle.provider();
        let wanted: HashSet<String> = keys.into_iter().collect();
        let stream = futures::stream::unfold((rx, wanted), move |(mut rx, wanted)| async move {
            loop {
                match rx.recv().await {
                    Ok(update) if update.provider == source && wanted.contains(&update.key) => {
                        return Some((update, (rx, wanted)))
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "update consumer lagging, skipped updates");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    pub async fn unsubscribe(&self, keys: Vec<String>) -> FeedResult<()> {
        self.unsubscribe_on(self.primary(), keys).await
    }

    pub async fn unsubscribe_on(&self, provider: ProviderKind, keys: Vec<String>) -> FeedResult<()> {
        let feed = self.feed(provider)?;
        feed.handle.unsubscribe(keys.clone()).await?;
        feed.pipeline.poller.untrack(&keys);
        for key in keys.iter().filter(|k| !feed.pipeline.poller.is_tracking(k)) {
            feed.pipeline.release(key);
        }
        Ok(())
    }

    pub async fn get_cached(&self, key: &str, cache_type: CacheType) -> Option<serde_json::Value> {
        self.cache.get_or_load(key, cache_type).await
    }

    pub async fn get_events(&self, filter: &EventFilter) -> FeedResult<Vec<Event>> {
        Ok(self.store.query(filter).await?)
    }

    pub async fn export_audit(&self, filter: &EventFilter, format: ExportFormat) -> FeedResult<Vec<u8>> {
        Ok(self.store.export(filter, format).await?)
    }

    /// Append a domain action from a collaborator.
    pub async fn record_event(&self, aggregate_id: &str, event: DomainEvent) -> FeedResult<Event> {
        Ok(self.store.append(aggregate_id, event).await?)
    }

    /// Force every feed onto a fresh socket.
    pub async fn reconnect(&self) -> FeedResult<()> {
        for feed in &self.feeds {
            feed.handle.reconnect().await?;
        }
        Ok(())
    }

    /// One entry per provider, in configuration order.
    pub fn status(&self) -> Vec<StreamStatus> {
        let now = self.clock.now_ms();
        self.feeds.iter().map(|feed| feed.status(now)).collect()
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn compression(&self) -> &Arc<CompressionManager> {
        &self.compression
    }

    /// Stop every task and close the store. Pending appends are flushed first.
    pub async fn shutdown(&self) {
        for feed in &self.feeds {
            if let Err(e) = feed.handle.disconnect().await {
                debug!(error = %e, "connection already stopped");
            }
            feed.pipeline.poller.shutdown();
        }
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "router task ended abnormally");
            }
        }
        self.store.close().await;
        info!("feed router stopped");
    }
}

impl Drop for FeedRouter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Where a provider's merged state lands in the cache.
fn cache_type_for(provider: ProviderKind) -> CacheType {
    match provider {
        ProviderKind::Birdeye => CacheType::TokenPrice,
        ProviderKind::Helius => CacheType::UserData,
    }
}

struct Pipeline {
    provider: Arc<StreamProvider>,
    merger: DeltaMerger,
    cache: Arc<CacheManager>,
    cache_type: CacheType,
    poller: Arc<FallbackPoller>,
    fetcher: Arc<dyn SnapshotFetcher>,
    updates: broadcast::Sender<Update>,
    latency: LatencyTracker,
    clock: Arc<dyn Clock>,
    resync_tx: mpsc::Sender<Resync>,
    resync_cooldown_ms: i64,
    emit_interval_ms: i64,
    /// Key -> when its last resync was started.
    resyncs: Mutex<HashMap<String, i64>>,
    /// Key -> when it last reached the broadcast.
    emitted: Mutex<HashMap<String, i64>>,
}

impl Pipeline {
    fn new(
        provider: Arc<StreamProvider>,
        stream: &StreamConfig,
        fallback: &FallbackConfig,
        poller: Arc<FallbackPoller>,
        fetcher: Arc<dyn SnapshotFetcher>,
        cache: Arc<CacheManager>,
        updates: broadcast::Sender<Update>,
        clock: Arc<dyn Clock>,
    ) -> (Arc<Self>, mpsc::Receiver<Resync>) {
        let (resync_tx, resync_rx) = mpsc::channel(RESYNC_BUFFER);
        let pipeline = Pipeline {
            cache_type: cache_type_for(provider.kind()),
            provider,
            merger: DeltaMerger::new(),
            cache,
            poller,
            fetcher,
            updates,
            latency: LatencyTracker::new(),
            clock,
            resync_tx,
            resync_cooldown_ms: fallback.poll_interval_ms as i64,
            emit_interval_ms: stream.emit_interval_ms as i64,
            resyncs: Mutex::new(HashMap::new()),
            emitted: Mutex::new(HashMap::new()),
        };
        (Arc::new(pipeline), resync_rx)
    }

    async fn run(
        self: Arc<Self>,
        events: Arc<MessageQueue<StreamEvent>>,
        mut polls: mpsc::Receiver<PriceSnapshot>,
        mut resyncs: mpsc::Receiver<Resync>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.pop() => match event {
                    Some(event) => self.on_event(event),
                    None => break,
                },
                Some(snapshot) = polls.recv() => self.on_poll(snapshot),
                Some((key, result)) = resyncs.recv() => self.on_resync(key, result),
            }
        }
        debug!(provider = self.provider.id(), "ingest pipeline stopped");
    }

    fn on_event(self: &Arc<Self>, event: StreamEvent) {
        if let Some(state) = self.poller.on_stream_event(&event) {
            debug!(provider = self.provider.id(), ?state, "fallback state changed");
        }
        let raw = match event {
            StreamEvent::Message(raw) => raw,
            StreamEvent::PermanentFailure { attempts } => {
                warn!(provider = self.provider.id(), attempts, "stream gave up reconnecting");
                return;
            }
            _ => return,
        };
        // the poller owns every key while it is active
        if self.poller.is_active() {
            return;
        }

        let started = Instant::now();
        let observed_at = self.clock.now_ms();
        match self.provider.parse(&raw, observed_at) {
            Ok(WireMessage::Snapshot(snapshot)) => {
                let key = snapshot.key.clone();
                let merged = self.merger.apply_snapshot(&key, snapshot);
                self.publish(merged, UpdateSource::Stream, started);
            }
            Ok(WireMessage::Delta(delta)) => match self.merger.apply_delta(&delta.key, &delta, observed_at) {
                Ok(merged) => self.publish(merged, UpdateSource::Stream, started),
                Err(FeedError::SequenceGap { key, .. }) => {
                    self.cache.remove(&key, self.cache_type);
                    self.resync(key);
                }
                Err(e) => warn!(key = %delta.key, error = %e, "delta rejected"),
            },
            Ok(WireMessage::Ping | WireMessage::Pong) => {}
            Ok(WireMessage::Ack(ack)) => debug!(%ack, "provider acknowledged"),
            Err(e) => warn!(error = %e, bytes = raw.len(), "discarding malformed message"),
        }
    }

    fn on_poll(&self, snapshot: PriceSnapshot) {
        // fetched before the stream took over, or released while in flight
        if !self.poller.is_active() || !self.poller.is_tracking(&snapshot.key) {
            debug!(key = %snapshot.key, "dropping stale poll result");
            return;
        }
        let started = Instant::now();
        let key = snapshot.key.clone();
        let merged = self.merger.apply_snapshot(&key, snapshot);
        self.publish(merged, UpdateSource::Fallback, started);
    }

    fn on_resync(&self, key: String, result: FeedResult<PriceSnapshot>) {
        match result {
            Ok(snapshot) if self.poller.is_tracking(&key) => {
                let started = Instant::now();
                let merged = self.merger.apply_snapshot(&key, snapshot);
                self.publish(merged, UpdateSource::Resync, started);
            }
            Ok(_) => debug!(%key, "dropping resync for released key"),
            Err(e) => warn!(%key, error = %e, "resync failed, key stays stale until the next snapshot"),
        }
    }

    /// Fetch a fresh snapshot for a key whose deltas stopped lining up.
    fn resync(self: &Arc<Self>, key: String) {
        let now = self.clock.now_ms();
        {
            let mut resyncs = self.resyncs.lock();
            if let Some(&started) = resyncs.get(&key) {
                if now - started < self.resync_cooldown_ms {
                    return;
                }
            }
            resyncs.insert(key.clone(), now);
        }
        debug!(%key, "sequence gap, requesting snapshot");
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let result = pipeline.fetcher.fetch(&key).await;
            if pipeline.resync_tx.send((key, result)).await.is_err() {
                debug!("pipeline gone before resync completed");
            }
        });
    }

    /// Forget everything held for a key nobody is subscribed to anymore.
    fn release(&self, key: &str) {
        self.merger.remove(key);
        self.resyncs.lock().remove(key);
        self.emitted.lock().remove(key);
    }

    /// Streamed updates of one key reach consumers at most once per
    /// `emit_interval_ms`. Fallback and resync snapshots always go out.
    fn should_emit(&self, key: &str, source: UpdateSource) -> bool {
        if self.emit_interval_ms <= 0 {
            return true;
        }
        let now = self.clock.now_ms();
        let mut emitted = self.emitted.lock();
        match emitted.get(key) {
            Some(&last) if source == UpdateSource::Stream && now - last < self.emit_interval_ms => false,
            _ => {
                emitted.insert(key.to_string(), now);
                true
            }
        }
    }

    fn publish(&self, snapshot: PriceSnapshot, source: UpdateSource, started: Instant) {
        match serde_json::to_value(&snapshot) {
            Ok(value) => self.cache.set(&snapshot.key, value, self.cache_type),
            Err(e) => warn!(key = %snapshot.key, error = %e, "snapshot not cacheable"),
        }
        if !self.should_emit(&snapshot.key, source) {
            return;
        }
        let update = Update { provider: self.provider.id(), key: snapshot.key.clone(), snapshot, source };
        self.latency.record(started);
        // no receivers is fine
        let _ = self.updates.send(update);
    }
}

fn state_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "disconnected",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Connected => "connected",
        ConnectionState::Reconnecting => "reconnecting",
        ConnectionState::Fallback => "fallback",
    }
}

/// Append a `ConnectionStateChanged` audit event for every move into
/// Connected, Disconnected or Fallback.
async fn record_transitions(
    store: Arc<EventStore>,
    provider: &'static str,
    mut state: watch::Receiver<ConnectionState>,
    poller: Arc<FallbackPoller>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) {
    let aggregate = format!("stream:{provider}");
    let mut last = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = state.changed() => if changed.is_err() { break; },
        }
        let current = *state.borrow_and_update();
        let audited = matches!(
            current,
            ConnectionState::Connected | ConnectionState::Disconnected | ConnectionState::Fallback
        );
        if !audited || last == Some(current) {
            continue;
        }
        last = Some(current);

        let reason = match current {
            ConnectionState::Fallback => poller.status().reason,
            _ => None,
        };
        let event = DomainEvent::ConnectionStateChanged {
            provider: provider.to_string(),
            state: state_label(current).to_string(),
            reason,
            timestamp: DateTime::<Utc>::from_timestamp_millis(clock.now_ms()).unwrap_or_else(Utc::now),
        };
        if let Err(e) = store.append(&aggregate, event).await {
            warn!(error = %e, "could not record connection state change");
        }
    }
}
