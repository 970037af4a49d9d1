//! One provider socket: connect, resubscribe, read/write, heartbeat and
//! reconnect with backoff. Everything outside talks to it through
//! `StreamCommand`s in and `StreamEvent`s out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::error::{FeedError, FeedResult};
use crate::market_data::adapters::{ProviderKind, StreamProvider, WireCodec};
use crate::market_data::health::{HealthAction, HealthConfig, HealthMonitor};
use crate::market_data::queue::{MessageQueue, DEFAULT_QUEUE_CAPACITY};
use crate::market_data::reconnect::{BackoffConfig, ReconnectPolicy};
use crate::market_data::subscription::{SubscriptionManager, MAX_BATCH};
use crate::market_data::wire::RawMessage;
use crate::telemetry;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    /// Drop the current socket (or skip the pending backoff) and connect again.
    Reconnect,
    /// Close the socket and stop the task.
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected,
    Disconnected { reason: String },
    Message(RawMessage),
    /// Emitted for failed connection attempts.
    Error(FeedError),
    Reconnecting { attempt: u32, delay: Duration },
    /// Full key set re-sent on a fresh socket.
    Resubscribed { keys: usize },
    PermanentFailure { attempts: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamStatistics {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub reconnect_count: u64,
    pub dropped_messages: u64,
    pub last_connected: Option<i64>,
    pub connected_since: Option<i64>,
}

impl StreamStatistics {
    pub fn uptime_ms(&self, now_ms: i64) -> u64 {
        self.connected_since
            .map(|since| now_ms.saturating_sub(since).max(0) as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub provider: ProviderKind,
    pub url: String,
    pub api_key: Option<String>,
    pub command_buffer: usize,
    pub queue_capacity: usize,
    pub max_batch: usize,
    /// Minimum gap between two streamed updates of one key reaching
    /// consumers; 0 publishes every one.
    pub emit_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::for_provider(ProviderKind::Birdeye)
    }
}

impl StreamConfig {
    pub fn for_provider(provider: ProviderKind) -> Self {
        let url = match provider {
            ProviderKind::Birdeye => "wss://public-api.birdeye.so/socket/solana",
            ProviderKind::Helius => "wss://mainnet.helius-rpc.com",
        };
        Self {
            provider,
            url: url.into(),
            api_key: None,
            command_buffer: 256,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_batch: MAX_BATCH,
            emit_interval_ms: 100,
        }
    }
}

/// Everything a connection task needs, resolved from settings by the router.
#[derive(Debug, Clone)]
pub struct ConnectionSetup {
    pub stream: StreamConfig,
    pub backoff: BackoffConfig,
    pub health: HealthConfig,
    /// Consecutive connect failures before the state reads `Fallback`.
    pub fallback_threshold: u32,
    /// Pause after the reconnect budget is exhausted.
    pub permanent_cooldown: Duration,
}

/// Cloneable front for a running connection task.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    provider: &'static str,
    commands: mpsc::Sender<StreamCommand>,
    state: watch::Receiver<ConnectionState>,
    stats: Arc<Mutex<StreamStatistics>>,
    events: Arc<MessageQueue<StreamEvent>>,
    cancel: CancellationToken,
}

impl StreamHandle {
    pub async fn send(&self, command: StreamCommand) -> FeedResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| FeedError::Connection(format!("{} stream task has stopped", self.provider)))
    }

    pub async fn subscribe(&self, keys: Vec<String>) -> FeedResult<()> {
        self.send(StreamCommand::Subscribe(keys)).await
    }

    pub async fn unsubscribe(&self, keys: Vec<String>) -> FeedResult<()> {
        self.send(StreamCommand::Unsubscribe(keys)).await
    }

    pub async fn reconnect(&self) -> FeedResult<()> {
        self.send(StreamCommand::Reconnect).await
    }

    pub async fn disconnect(&self) -> FeedResult<()> {
        self.send(StreamCommand::Disconnect).await
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn statistics(&self) -> StreamStatistics {
        let mut stats = self.stats.lock().clone();
        stats.dropped_messages = self.events.dropped_count();
        stats
    }

    pub fn events(&self) -> Arc<MessageQueue<StreamEvent>> {
        Arc::clone(&self.events)
    }

    /// Cooperative teardown; the task closes its socket at the next await.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

enum Control {
    Reconnect,
    Shutdown,
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

pub struct StreamConnection {
    setup: ConnectionSetup,
    provider: Arc<StreamProvider>,
    backoff: ReconnectPolicy,
    subs: SubscriptionManager,
    events: Arc<MessageQueue<StreamEvent>>,
    state_tx: watch::Sender<ConnectionState>,
    stats: Arc<Mutex<StreamStatistics>>,
    clock: Arc<dyn Clock>,
}

impl StreamConnection {
    pub fn spawn(
        setup: ConnectionSetup,
        provider: Arc<StreamProvider>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> (StreamHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(setup.stream.command_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let events = Arc::new(MessageQueue::new(setup.stream.queue_capacity));
        let stats = Arc::new(Mutex::new(StreamStatistics::default()));

        let handle = StreamHandle {
            provider: provider.id(),
            commands: cmd_tx,
            state: state_rx,
            stats: Arc::clone(&stats),
            events: Arc::clone(&events),
            cancel: cancel.clone(),
        };

        let connection = StreamConnection {
            backoff: ReconnectPolicy::new(setup.backoff.clone()),
            subs: SubscriptionManager::new(setup.stream.max_batch),
            setup,
            provider,
            events,
            state_tx,
            stats,
            clock,
        };
        let task = tokio::spawn(connection.run(cmd_rx, cancel));
        (handle, task)
    }

    #[instrument(name = "stream", skip_all, fields(provider = self.provider.id()))]
    async fn run(mut self, mut commands: mpsc::Receiver<StreamCommand>, cancel: CancellationToken) {
        let url = self
            .provider
            .connect_url(&self.setup.stream.url, self.setup.stream.api_key.as_deref());
        let mut consecutive_failures: u32 = 0;
        self.set_state(ConnectionState::Connecting);

        'outer: loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                res = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str())) => res,
            };

            match attempt {
                Ok(Ok((ws, _response))) => {
                    consecutive_failures = 0;
                    self.backoff.reset();
                    let now = self.clock.now_ms();
                    {
                        let mut stats = self.stats.lock();
                        stats.last_connected = Some(now);
                        stats.connected_since = Some(now);
                    }
                    info!("connected");
                    self.set_state(ConnectionState::Connected);
                    self.emit(StreamEvent::Connected);

                    let end = self.session(ws, &mut commands, &cancel).await;
                    self.stats.lock().connected_since = None;
                    match end {
                        SessionEnd::Shutdown => break 'outer,
                        SessionEnd::Dropped(reason) => {
                            warn!(%reason, "stream dropped");
                            self.emit(StreamEvent::Disconnected { reason });
                            self.set_state(ConnectionState::Reconnecting);
                        }
                    }
                }
                failed => {
                    let err = match failed {
                        Ok(Err(e)) => FeedError::from(e),
                        _ => FeedError::Connection(format!("connect timed out after {CONNECT_TIMEOUT:?}")),
                    };
                    consecutive_failures += 1;
                    warn!(error = %err, consecutive_failures, "connect failed");
                    self.emit(StreamEvent::Error(err));
                    if consecutive_failures >= self.setup.fallback_threshold {
                        self.set_state(ConnectionState::Fallback);
                    } else {
                        self.set_state(ConnectionState::Reconnecting);
                    }
                }
            }

            let pause = match self.backoff.next() {
                Ok(delay) => {
                    self.stats.lock().reconnect_count += 1;
                    metrics::counter!(telemetry::RECONNECTS).increment(1);
                    self.emit(StreamEvent::Reconnecting { attempt: self.backoff.attempt(), delay });
                    delay
                }
                Err(_) => {
                    let attempts = self.backoff.attempt();
                    warn!(attempts, cooldown = ?self.setup.permanent_cooldown, "giving up on stream for now");
                    self.set_state(ConnectionState::Fallback);
                    self.emit(StreamEvent::PermanentFailure { attempts });
                    self.backoff.reset();
                    self.setup.permanent_cooldown
                }
            };

            if let Some(Control::Shutdown) = self.wait(pause, &mut commands, &cancel).await {
                break 'outer;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        self.emit(StreamEvent::Disconnected { reason: "shutdown".into() });
        info!("stream task stopped");
    }

    async fn session(
        &mut self,
        ws: WsStream,
        commands: &mut mpsc::Receiver<StreamCommand>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        // the provider forgets everything on a new socket
        self.subs.reset_sent();
        match self.flush(&mut write).await {
            Ok(keys) => {
                debug!(keys, "resubscribed");
                self.emit(StreamEvent::Resubscribed { keys });
            }
            Err(e) => return SessionEnd::Dropped(format!("resubscribe failed: {e}")),
        }

        let mut health = HealthMonitor::new(&self.setup.health, Instant::now());
        let mut ticker = tokio::time::interval(self.setup.health.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                cmd = commands.recv() => {
                    let mut control = match cmd {
                        Some(cmd) => self.apply(cmd),
                        None => Some(Control::Shutdown),
                    };
                    // coalesce whatever else is queued into one flush
                    while control.is_none() {
                        match commands.try_recv() {
                            Ok(next) => control = self.apply(next),
                            Err(_) => break,
                        }
                    }
                    if let Err(e) = self.flush(&mut write).await {
                        return SessionEnd::Dropped(format!("send failed: {e}"));
                    }
                    match control {
                        Some(Control::Shutdown) => {
                            let _ = write.send(Message::Close(None)).await;
                            return SessionEnd::Shutdown;
                        }
                        Some(Control::Reconnect) => {
                            let _ = write.send(Message::Close(None)).await;
                            return SessionEnd::Dropped("reconnect requested".into());
                        }
                        None => {}
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        health.on_message(Instant::now());
                        self.received(RawMessage::Text(text));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        health.on_message(Instant::now());
                        self.received(RawMessage::Binary(bytes));
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        health.on_message(Instant::now());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        return SessionEnd::Dropped(format!("closed by server {reason}").trim_end().to_string());
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    None => return SessionEnd::Dropped("stream ended".into()),
                },
                _ = ticker.tick() => match health.tick(Instant::now()) {
                    HealthAction::Idle => {}
                    HealthAction::SendPing => {
                        debug!("quiet stream, sending ping");
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            return SessionEnd::Dropped(format!("ping failed: {e}"));
                        }
                    }
                    HealthAction::Stale => {
                        let silence = health.silence(Instant::now());
                        warn!(silence_ms = silence.as_millis() as u64, "stream stale, forcing reconnect");
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Dropped("stale".into());
                    }
                },
            }
        }
    }

    /// Sleep out a backoff while still accepting subscription changes.
    async fn wait(
        &mut self,
        pause: Duration,
        commands: &mut mpsc::Receiver<StreamCommand>,
        cancel: &CancellationToken,
    ) -> Option<Control> {
        let sleep = tokio::time::sleep(pause);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Some(Control::Shutdown),
                _ = &mut sleep => return None,
                cmd = commands.recv() => match cmd.map(|c| self.apply(c)) {
                    None | Some(Some(Control::Shutdown)) => return Some(Control::Shutdown),
                    Some(Some(Control::Reconnect)) => return None,
                    Some(None) => {}
                },
            }
        }
    }

    fn apply(&mut self, command: StreamCommand) -> Option<Control> {
        match command {
            StreamCommand::Subscribe(keys) => {
                self.subs.subscribe(&keys);
                None
            }
            StreamCommand::Unsubscribe(keys) => {
                self.subs.unsubscribe(&keys);
                None
            }
            StreamCommand::Reconnect => Some(Control::Reconnect),
            StreamCommand::Disconnect => Some(Control::Shutdown),
        }
    }

    /// Send net subscription changes. Returns the number of keys subscribed.
    async fn flush<S>(&mut self, write: &mut S) -> FeedResult<usize>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let pending = self.subs.flush();
        for batch in &pending.unsubscribe {
            self.send_frame(write, self.provider.unsubscribe_frame(batch)).await?;
        }
        for batch in &pending.subscribe {
            self.send_frame(write, self.provider.subscribe_frame(batch)).await?;
        }
        Ok(pending.subscribed_keys())
    }

    async fn send_frame<S>(&self, write: &mut S, frame: String) -> FeedResult<()>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let len = frame.len() as u64;
        write.send(Message::Text(frame)).await?;
        let mut stats = self.stats.lock();
        stats.messages_sent += 1;
        stats.bytes_sent += len;
        Ok(())
    }

    fn received(&self, raw: RawMessage) {
        {
            let mut stats = self.stats.lock();
            stats.messages_received += 1;
            stats.bytes_received += raw.len() as u64;
        }
        metrics::counter!(telemetry::MESSAGES_RECEIVED).increment(1);
        self.emit(StreamEvent::Message(raw));
    }

    fn emit(&self, event: StreamEvent) {
        self.events.push(event);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "connection state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::market_data::fallback::{FallbackConfig, FallbackPoller, SnapshotFetcher};
    use crate::market_data::wire::PriceSnapshot;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    struct NoopFetcher;

    #[async_trait::async_trait]
    impl SnapshotFetcher for NoopFetcher {
        async fn fetch(&self, key: &str) -> FeedResult<PriceSnapshot> {
            Ok(PriceSnapshot::new(key, Default::default(), 0, 0))
        }
    }

    // Connection 0 streams three prices then closes; 1 and 2 fail the
    // handshake; 3 onwards accept and report what they receive.
    async fn scripted_server() -> (String, mpsc::UnboundedReceiver<(usize, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut accepted = 0usize;
            while let Ok((tcp, _)) = listener.accept().await {
                let idx = accepted;
                accepted += 1;
                if idx == 1 || idx == 2 {
                    drop(tcp);
                    continue;
                }
                let seen = seen_tx.clone();
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Text(text) = msg {
                            let _ = seen.send((idx, text));
                            if idx == 0 {
                                for i in 0..3 {
                                    let frame = format!(r#"{{"type":"price","data":{{"symbol":"SOL","price":{}}}}}"#, 100 + i);
                                    ws.send(Message::Text(frame)).await.unwrap();
                                }
                                let _ = ws.close(None).await;
                                break;
                            }
                        }
                    }
                });
            }
        });
        (format!("ws://{addr}"), seen_rx)
    }

    fn setup(url: String) -> ConnectionSetup {
        ConnectionSetup {
            stream: StreamConfig { url, ..Default::default() },
            backoff: BackoffConfig { base_delay_ms: 20, max_delay_ms: 1_000, jitter: 0.2, max_attempts: 10 },
            health: HealthConfig::default(),
            fallback_threshold: 3,
            permanent_cooldown: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_drop_two_failed_reconnects_then_resubscribe() {
        let (url, mut seen) = scripted_server().await;
        let cancel = CancellationToken::new();
        let provider = Arc::new(StreamProvider::new(ProviderKind::Birdeye));
        let (handle, task) = StreamConnection::spawn(setup(url), provider, clock::system(), cancel.clone());
        handle.subscribe(vec!["SOL".into()]).await.unwrap();

        let (poll_tx, _poll_rx) = mpsc::channel(8);
        let poller = FallbackPoller::new(
            FallbackConfig { failure_threshold: 3, ..Default::default() },
            Arc::new(NoopFetcher),
            poll_tx,
            clock::system(),
        );

        let events = handle.events();
        let mut log = Vec::new();
        let mut fallback_ever_active = false;
        timeout(Duration::from_secs(10), async {
            let mut connects = 0;
            loop {
                let ev = events.pop().await.unwrap();
                poller.on_stream_event(&ev);
                fallback_ever_active |= poller.is_active();
                if ev == StreamEvent::Connected {
                    connects += 1;
                }
                let done = connects == 2 && ev == StreamEvent::Resubscribed { keys: 1 };
                log.push(ev);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("scenario did not complete");

        let messages = log.iter().filter(|e| matches!(e, StreamEvent::Message(_))).count();
        let failures = log.iter().filter(|e| matches!(e, StreamEvent::Error(FeedError::Connection(_)))).count();
        let delays: Vec<Duration> = log
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Reconnecting { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(messages, 3);
        assert_eq!(failures, 2);
        assert_eq!(delays.len(), 3);
        assert!(delays[0] >= Duration::from_millis(16) && delays[0] <= Duration::from_millis(24));
        assert!(delays[1] >= Duration::from_millis(32) && delays[1] <= Duration::from_millis(48));
        assert!(!fallback_ever_active);
        assert_eq!(handle.state(), ConnectionState::Connected);

        // first frame on the fresh socket is the full resubscription
        let (idx, frame) = loop {
            let (idx, frame) = seen.recv().await.unwrap();
            if idx == 3 {
                break (idx, frame);
            }
        };
        assert_eq!(idx, 3);
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "subscribe");
        assert_eq!(v["data"]["symbols"], serde_json::json!(["SOL"]));

        let stats = handle.statistics();
        assert_eq!(stats.messages_received, 3);
        assert_eq!(stats.reconnect_count, 3);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    // Completes the handshake, then never reads or writes again, so pings
    // go unanswered.
    async fn silent_server() -> (String, mpsc::UnboundedReceiver<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut accepted = 0usize;
            while let Ok((tcp, _)) = listener.accept().await {
                accepted += 1;
                let _ = accepted_tx.send(accepted);
                tokio::spawn(async move {
                    let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(ws);
                });
            }
        });
        (format!("ws://{addr}"), accepted_rx)
    }

    #[tokio::test]
    async fn test_silent_stream_is_dropped_as_stale_and_reconnected() {
        let (url, mut accepted) = silent_server().await;
        let mut cfg = setup(url);
        cfg.backoff = BackoffConfig { base_delay_ms: 1, max_delay_ms: 5, jitter: 0.0, max_attempts: 10 };
        cfg.health = HealthConfig { ping_interval_ms: 20, stale_after_ms: 60, tick_interval_ms: 10 };
        let cancel = CancellationToken::new();
        let (handle, task) = StreamConnection::spawn(
            cfg,
            Arc::new(StreamProvider::new(ProviderKind::Birdeye)),
            clock::system(),
            cancel.clone(),
        );
        handle.subscribe(vec!["SOL".into()]).await.unwrap();

        let events = handle.events();
        let log = timeout(Duration::from_secs(10), async {
            let mut log = Vec::new();
            let mut stale_seen = false;
            loop {
                let ev = events.pop().await.unwrap();
                stale_seen |= ev == StreamEvent::Disconnected { reason: "stale".into() };
                let done = stale_seen && matches!(ev, StreamEvent::Resubscribed { .. });
                log.push(ev);
                if done {
                    break log;
                }
            }
        })
        .await
        .expect("stale session was not replaced");

        let stale_at = log
            .iter()
            .position(|e| *e == StreamEvent::Disconnected { reason: "stale".into() })
            .unwrap();
        assert_eq!(log[0], StreamEvent::Connected);
        assert!(matches!(log[1], StreamEvent::Resubscribed { .. }));
        // silence, not a provider close or a failed connect, ended the session
        assert!(log[..stale_at]
            .iter()
            .all(|e| matches!(e, StreamEvent::Connected | StreamEvent::Resubscribed { .. })));
        assert!(!log.iter().any(|e| matches!(e, StreamEvent::Error(_))));
        let after: Vec<&StreamEvent> = log[stale_at + 1..]
            .iter()
            .filter(|e| !matches!(e, StreamEvent::Reconnecting { .. }))
            .collect();
        assert_eq!(after.len(), 2);
        assert_eq!(*after[0], StreamEvent::Connected);
        assert_eq!(*after[1], StreamEvent::Resubscribed { keys: 1 });

        assert_eq!(accepted.recv().await, Some(1));
        assert_eq!(accepted.recv().await, Some(2));
        assert_eq!(handle.statistics().messages_received, 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_provider_reaches_fallback_state() {
        // bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let mut cfg = setup(format!("ws://{addr}"));
        cfg.backoff = BackoffConfig { base_delay_ms: 1, max_delay_ms: 2, jitter: 0.0, max_attempts: 5 };
        let cancel = CancellationToken::new();
        let (handle, task) = StreamConnection::spawn(
            cfg,
            Arc::new(StreamProvider::new(ProviderKind::Birdeye)),
            clock::system(),
            cancel.clone(),
        );

        let events = handle.events();
        let permanent = timeout(Duration::from_secs(10), async {
            loop {
                if let StreamEvent::PermanentFailure { attempts } = events.pop().await.unwrap() {
                    break attempts;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(permanent, 5);
        assert_eq!(handle.state(), ConnectionState::Fallback);

        handle.disconnect().await.unwrap();
        task.await.unwrap();
    }
}
