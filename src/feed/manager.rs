// =============================================================================
// Feed subscription manager
// =============================================================================
//
// Owns the single upstream WebSocket and multiplexes every display
// subscription over it. Symbols are refcounted: the first subscriber triggers
// an upstream SUBSCRIBE (and an initial SNAPSHOT request), later subscribers
// share the cached snapshot, and the last unsubscribe sends UNSUBSCRIBE and
// discards the instrument. Ticks fan out to per-display ingress queues with a
// non-blocking send — the dispatcher never waits on a slow display.
//
// Reconnect policy: exponential backoff from 500 ms doubling to a 30 s cap
// with full jitter. Active subscriptions are replayed on every reconnect.
// Past the alert threshold a `connection_lost` error is surfaced to every
// display while retrying continues. A heartbeat watchdog forces a reconnect
// after 3 missed intervals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::FeedError;
use crate::runtime_config::EngineConfig;
use crate::types::ConnectionState;

use super::ingress::{EventSender, FeedEvent};
use super::protocol::{self, Frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;

// =============================================================================
// Settings & metrics
// =============================================================================

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub url: String,
    pub auth_token: String,
    pub auth_secret: String,
    pub heartbeat_interval_ms: u64,
    pub initial_snapshot_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_alert_threshold: u32,
}

impl FeedSettings {
    /// Build settings from the engine config plus credentials from the
    /// environment (`PULSEDESK_FEED_TOKEN` / `PULSEDESK_FEED_SECRET`).
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            url: config.feed_url.clone(),
            auth_token: std::env::var("PULSEDESK_FEED_TOKEN").unwrap_or_default(),
            auth_secret: std::env::var("PULSEDESK_FEED_SECRET").unwrap_or_default(),
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            initial_snapshot_timeout_ms: config.initial_snapshot_timeout_ms,
            reconnect_base_delay_ms: config.reconnect_base_delay_ms,
            reconnect_max_delay_ms: config.reconnect_max_delay_ms,
            reconnect_alert_threshold: config.reconnect_alert_threshold,
        }
    }
}

/// Lock-free counters read through [`FeedMetricsSnapshot`].
pub struct FeedMetrics {
    pub ticks_routed: AtomicU64,
    /// Shared with every ingress queue so overflow drops aggregate here.
    pub ticks_dropped: Arc<AtomicU64>,
    pub snapshots_received: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_heartbeat_ms: AtomicI64,
}

impl FeedMetrics {
    fn new() -> Self {
        Self {
            ticks_routed: AtomicU64::new(0),
            ticks_dropped: Arc::new(AtomicU64::new(0)),
            snapshots_received: AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_heartbeat_ms: AtomicI64::new(0),
        }
    }

    fn snapshot(&self, now_ms: i64) -> FeedMetricsSnapshot {
        let last_heartbeat = self.last_heartbeat_ms.load(Ordering::Relaxed);
        FeedMetricsSnapshot {
            ticks_routed: self.ticks_routed.load(Ordering::Relaxed),
            ticks_dropped: self.ticks_dropped.load(Ordering::Relaxed),
            snapshots_received: self.snapshots_received.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_heartbeat_age_ms: if last_heartbeat > 0 {
                Some(now_ms - last_heartbeat)
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedMetricsSnapshot {
    pub ticks_routed: u64,
    pub ticks_dropped: u64,
    pub snapshots_received: u64,
    pub frames_rejected: u64,
    pub reconnects: u64,
    pub last_heartbeat_age_ms: Option<i64>,
}

// =============================================================================
// Handle & subscription guard
// =============================================================================

enum FeedCommand {
    Subscribe {
        id: Uuid,
        symbol: String,
        sink: EventSender,
    },
    Unsubscribe {
        id: Uuid,
        symbol: String,
    },
    ForceReconnect,
}

/// Cheap-clone handle shared by displays and the API layer.
#[derive(Clone)]
pub struct FeedHandle {
    cmd_tx: mpsc::UnboundedSender<FeedCommand>,
    metrics: Arc<FeedMetrics>,
    state: Arc<RwLock<ConnectionState>>,
}

impl FeedHandle {
    /// Register a display's ingress sink for `symbol`. The returned guard
    /// unsubscribes on drop, so release happens on every exit path.
    pub fn subscribe(&self, symbol: &str, sink: EventSender) -> SubscriptionGuard {
        let id = Uuid::new_v4();
        let _ = self.cmd_tx.send(FeedCommand::Subscribe {
            id,
            symbol: symbol.to_string(),
            sink,
        });
        SubscriptionGuard {
            id,
            symbol: symbol.to_string(),
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub fn force_reconnect(&self) {
        let _ = self.cmd_tx.send(FeedCommand::ForceReconnect);
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn metrics(&self) -> FeedMetricsSnapshot {
        self.metrics.snapshot(now_ms())
    }

    /// The shared counter ingress queues bump when they drop a tick.
    pub fn dropped_tick_counter(&self) -> Arc<AtomicU64> {
        self.metrics.ticks_dropped.clone()
    }
}

/// RAII subscription. Dropping it releases the symbol refcount.
pub struct SubscriptionGuard {
    id: Uuid,
    symbol: String,
    cmd_tx: mpsc::UnboundedSender<FeedCommand>,
}

impl SubscriptionGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(FeedCommand::Unsubscribe {
            id: self.id,
            symbol: self.symbol.clone(),
        });
    }
}

/// Handle backed by no manager task; registry commands land in a parked
/// channel. Lets display-layer tests drive pipelines directly.
#[cfg(test)]
pub(crate) fn test_handle() -> FeedHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    std::mem::forget(cmd_rx);
    FeedHandle {
        cmd_tx,
        metrics: Arc::new(FeedMetrics::new()),
        state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
    }
}

/// Spawn the manager task and return its handle.
pub fn spawn(settings: FeedSettings) -> FeedHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let metrics = Arc::new(FeedMetrics::new());
    let state = Arc::new(RwLock::new(ConnectionState::Disconnected));

    let manager = FeedManager::new(settings, cmd_rx, metrics.clone(), state.clone());
    tokio::spawn(manager.run());

    FeedHandle {
        cmd_tx,
        metrics,
        state,
    }
}

// =============================================================================
// Manager internals
// =============================================================================

#[derive(Default)]
struct SymbolRoute {
    sinks: Vec<(Uuid, EventSender)>,
    descriptor: Option<protocol::SnapshotFrame>,
    pending_since_ms: Option<i64>,
    timeout_notified: bool,
}

enum CommandEffect {
    Quiet,
    Send(Vec<Frame>),
    Reconnect,
}

enum ServeExit {
    Reconnect(String),
    Fatal(FeedError),
    Shutdown,
}

struct FeedManager {
    settings: FeedSettings,
    cmd_rx: mpsc::UnboundedReceiver<FeedCommand>,
    routes: HashMap<String, SymbolRoute>,
    metrics: Arc<FeedMetrics>,
    state: Arc<RwLock<ConnectionState>>,
}

impl FeedManager {
    fn new(
        settings: FeedSettings,
        cmd_rx: mpsc::UnboundedReceiver<FeedCommand>,
        metrics: Arc<FeedMetrics>,
        state: Arc<RwLock<ConnectionState>>,
    ) -> Self {
        Self {
            settings,
            cmd_rx,
            routes: HashMap::new(),
            metrics,
            state,
        }
    }

    async fn run(mut self) {
        let mut attempts: u32 = 0;
        loop {
            self.set_state(ConnectionState::Connecting);
            info!(url = %self.settings.url, "connecting to upstream feed");

            match connect_async(self.settings.url.as_str()).await {
                Ok((ws, _response)) => {
                    attempts = 0;
                    match self.serve(ws).await {
                        ServeExit::Shutdown => {
                            self.set_state(ConnectionState::Disconnected);
                            info!("feed manager stopped");
                            return;
                        }
                        ServeExit::Fatal(err) => {
                            error!(error = %err, "fatal feed error, reconnect disabled");
                            self.broadcast_error(err);
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        ServeExit::Reconnect(reason) => {
                            warn!(reason = %reason, "feed connection lost");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "feed connection attempt failed");
                }
            }

            self.set_state(ConnectionState::Disconnected);
            attempts = attempts.saturating_add(1);
            self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
            if attempts >= self.settings.reconnect_alert_threshold {
                self.broadcast_error(FeedError::ConnectionLost { attempts });
            }

            let delay = backoff_delay(
                attempts,
                self.settings.reconnect_base_delay_ms,
                self.settings.reconnect_max_delay_ms,
            );
            debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "reconnect backoff");
            if !self.idle_wait(delay).await {
                info!("feed manager stopped while disconnected");
                return;
            }
        }
    }

    /// Serve one established connection until it breaks.
    async fn serve(&mut self, ws: WsStream) -> ServeExit {
        let (mut sink, mut stream) = ws.split();

        self.set_state(ConnectionState::Authenticating);
        let now = now_ms();
        let auth =
            protocol::auth_frame(&self.settings.auth_token, &self.settings.auth_secret, now);
        if let Err(e) = send_frame(&mut sink, &auth).await {
            return ServeExit::Reconnect(format!("auth write failed: {e}"));
        }

        // Replay every active subscription.
        let symbols: Vec<String> = self
            .routes
            .iter()
            .filter(|(_, route)| !route.sinks.is_empty())
            .map(|(symbol, _)| symbol.clone())
            .collect();
        for symbol in symbols {
            let frame = Frame::Subscribe {
                symbol: symbol.clone(),
            };
            if let Err(e) = send_frame(&mut sink, &frame).await {
                return ServeExit::Reconnect(format!("resubscribe write failed: {e}"));
            }
            if let Some(route) = self.routes.get_mut(&symbol) {
                route.pending_since_ms = Some(now);
                route.timeout_notified = false;
            }
        }

        self.set_state(ConnectionState::Connected);
        self.metrics.last_heartbeat_ms.store(now, Ordering::Relaxed);
        info!(
            subscriptions = self.routes.len(),
            "feed session established"
        );

        let mut heartbeat = tokio::time::interval(Duration::from_millis(
            self.settings.heartbeat_interval_ms.max(1_000),
        ));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut maintenance = tokio::time::interval(Duration::from_millis(1_000));
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return ServeExit::Shutdown };
                    match self.apply_command(cmd, now_ms()) {
                        CommandEffect::Quiet => {}
                        CommandEffect::Send(frames) => {
                            for frame in frames {
                                if let Err(e) = send_frame(&mut sink, &frame).await {
                                    return ServeExit::Reconnect(format!("write failed: {e}"));
                                }
                            }
                        }
                        CommandEffect::Reconnect => {
                            return ServeExit::Reconnect("operator-forced reconnect".into());
                        }
                    }
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match protocol::decode(&text) {
                            Ok(frame) => {
                                if let Some(exit) = self.dispatch(frame, now_ms()) {
                                    return exit;
                                }
                            }
                            Err(e) => {
                                self.metrics.frames_rejected.fetch_add(1, Ordering::Relaxed);
                                warn!(error = %e, "rejected inbound frame");
                            }
                        },
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Binary(_))) => {
                            self.metrics.frames_rejected.fetch_add(1, Ordering::Relaxed);
                            warn!("unexpected binary frame from feed");
                        }
                        Some(Ok(Message::Close(_))) => {
                            return ServeExit::Reconnect("server closed the connection".into());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return ServeExit::Reconnect(format!("read error: {e}"));
                        }
                        None => {
                            return ServeExit::Reconnect("stream ended".into());
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    let frame = Frame::Heartbeat { timestamp_ms: now_ms() };
                    if let Err(e) = send_frame(&mut sink, &frame).await {
                        return ServeExit::Reconnect(format!("heartbeat write failed: {e}"));
                    }
                }

                _ = maintenance.tick() => {
                    let now = now_ms();
                    let silence = now - self.metrics.last_heartbeat_ms.load(Ordering::Relaxed);
                    if silence > 3 * self.settings.heartbeat_interval_ms as i64 {
                        return ServeExit::Reconnect(format!("heartbeat silence for {silence} ms"));
                    }
                    self.check_pending(now);
                }
            }
        }
    }

    /// Sleep through the reconnect backoff while still serving registry
    /// commands. Returns false when the command channel closed.
    async fn idle_wait(&mut self, delay: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return false,
                    Some(cmd) => {
                        // Upstream writes are impossible here; subscriptions
                        // are replayed on the next connect.
                        let _ = self.apply_command(cmd, now_ms());
                    }
                }
            }
        }
    }

    fn apply_command(&mut self, cmd: FeedCommand, now: i64) -> CommandEffect {
        match cmd {
            FeedCommand::Subscribe { id, symbol, sink } => {
                let route = self.routes.entry(symbol.clone()).or_default();
                let first = route.sinks.is_empty();

                // Later subscribers of an already-known symbol start from the
                // cached snapshot.
                if let Some(descriptor) = &route.descriptor {
                    sink.send(FeedEvent::Initialized(descriptor.clone()));
                }
                route.sinks.push((id, sink));
                debug!(symbol = %symbol, refcount = route.sinks.len(), "subscription added");

                if first && route.descriptor.is_none() {
                    route.pending_since_ms = Some(now);
                    route.timeout_notified = false;
                }
                if first {
                    CommandEffect::Send(vec![Frame::Subscribe { symbol }])
                } else {
                    CommandEffect::Quiet
                }
            }

            FeedCommand::Unsubscribe { id, symbol } => {
                let Some(route) = self.routes.get_mut(&symbol) else {
                    return CommandEffect::Quiet;
                };
                route.sinks.retain(|(sink_id, _)| *sink_id != id);
                if route.sinks.is_empty() {
                    // Last reference: drop the instrument and tell upstream.
                    self.routes.remove(&symbol);
                    debug!(symbol = %symbol, "last subscription removed");
                    CommandEffect::Send(vec![Frame::Unsubscribe { symbol }])
                } else {
                    debug!(symbol = %symbol, "subscription removed");
                    CommandEffect::Quiet
                }
            }

            FeedCommand::ForceReconnect => CommandEffect::Reconnect,
        }
    }

    /// Route one inbound frame. Returns an exit only for fatal errors.
    fn dispatch(&mut self, frame: Frame, now: i64) -> Option<ServeExit> {
        match frame {
            Frame::Snapshot(snapshot) => {
                self.metrics
                    .snapshots_received
                    .fetch_add(1, Ordering::Relaxed);
                match self.routes.get_mut(&snapshot.symbol) {
                    Some(route) => {
                        route.pending_since_ms = None;
                        route.timeout_notified = false;
                        for (_, sink) in &route.sinks {
                            sink.send(FeedEvent::Initialized(snapshot.clone()));
                        }
                        route.descriptor = Some(snapshot);
                    }
                    None => {
                        debug!(symbol = %snapshot.symbol, "snapshot for unsubscribed symbol ignored");
                    }
                }
                None
            }

            Frame::Tick(tick_frame) => {
                if let Some(route) = self.routes.get(&tick_frame.symbol) {
                    let tick = tick_frame.tick();
                    for (_, sink) in &route.sinks {
                        sink.send(FeedEvent::Tick(tick));
                    }
                    self.metrics.ticks_routed.fetch_add(1, Ordering::Relaxed);
                }
                None
            }

            Frame::Heartbeat { .. } => {
                self.metrics.last_heartbeat_ms.store(now, Ordering::Relaxed);
                None
            }

            Frame::Error {
                code,
                message,
                symbol,
            } => {
                let err = FeedError::from_wire(&code, &message, symbol.as_deref());
                if err.is_fatal() {
                    return Some(ServeExit::Fatal(err));
                }
                match symbol {
                    Some(symbol) => {
                        if let Some(route) = self.routes.get(&symbol) {
                            for (_, sink) in &route.sinks {
                                sink.send(FeedEvent::Error(err.clone()));
                            }
                        }
                    }
                    None => self.broadcast_error(err),
                }
                None
            }

            // Client-to-server frames have no business arriving here.
            Frame::Auth { .. } | Frame::Subscribe { .. } | Frame::Unsubscribe { .. } => {
                self.metrics.frames_rejected.fetch_add(1, Ordering::Relaxed);
                warn!("unexpected client-side frame from feed");
                None
            }
        }
    }

    /// Surface initial-snapshot timeouts, once per pending wait.
    fn check_pending(&mut self, now: i64) {
        let timeout = self.settings.initial_snapshot_timeout_ms as i64;
        for (symbol, route) in &mut self.routes {
            if let Some(since) = route.pending_since_ms {
                if !route.timeout_notified && now - since > timeout {
                    warn!(symbol = %symbol, waited_ms = now - since, "initial snapshot timed out");
                    for (_, sink) in &route.sinks {
                        sink.send(FeedEvent::Error(FeedError::InitialSnapshotTimeout {
                            waited_ms: (now - since) as u64,
                        }));
                    }
                    route.timeout_notified = true;
                }
            }
        }
    }

    fn broadcast_error(&mut self, err: FeedError) {
        for route in self.routes.values() {
            for (_, sink) in &route.sinks {
                sink.send(FeedEvent::Error(err.clone()));
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> anyhow::Result<()> {
    let text = protocol::encode(frame)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Exponential ceiling for the nth consecutive failure.
fn backoff_ceiling(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let doublings = attempt.saturating_sub(1).min(16);
    base_ms.saturating_mul(1u64 << doublings).min(cap_ms).max(1)
}

/// Full-jitter backoff: uniform in `[0, ceiling]`.
fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let ceiling = backoff_ceiling(attempt, base_ms, cap_ms);
    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ingress::{self, EventReceiver};
    use crate::feed::protocol::{SnapshotFrame, TickFrame};

    fn settings() -> FeedSettings {
        FeedSettings {
            url: "wss://feed.test/v1/stream".into(),
            auth_token: "token".into(),
            auth_secret: "secret".into(),
            heartbeat_interval_ms: 10_000,
            initial_snapshot_timeout_ms: 10_000,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            reconnect_alert_threshold: 5,
        }
    }

    fn manager() -> FeedManager {
        let (_tx, rx) = mpsc::unbounded_channel();
        FeedManager::new(
            settings(),
            rx,
            Arc::new(FeedMetrics::new()),
            Arc::new(RwLock::new(ConnectionState::Disconnected)),
        )
    }

    fn sink_pair(metrics: &FeedMetrics) -> (EventSender, EventReceiver) {
        ingress::channel(64, metrics.ticks_dropped.clone())
    }

    fn snapshot(symbol: &str) -> SnapshotFrame {
        SnapshotFrame {
            symbol: symbol.into(),
            digits: 5,
            todays_open: 1.08500,
            projected_adr_high: 1.08750,
            projected_adr_low: 1.08350,
            todays_high: 1.08680,
            todays_low: 1.08420,
            m1_candles: Vec::new(),
        }
    }

    fn tick_frame(symbol: &str, ts: i64) -> Frame {
        Frame::Tick(TickFrame {
            symbol: symbol.into(),
            bid: 1.08499,
            ask: 1.08501,
            bid_size: 1.0,
            ask_size: 1.0,
            timestamp_ms: ts,
            day_id: 1,
        })
    }

    #[test]
    fn first_subscribe_sends_upstream_subscribe() {
        let mut mgr = manager();
        let (sink, _rx) = sink_pair(&mgr.metrics);
        let effect = mgr.apply_command(
            FeedCommand::Subscribe {
                id: Uuid::new_v4(),
                symbol: "EURUSD".into(),
                sink,
            },
            0,
        );
        match effect {
            CommandEffect::Send(frames) => {
                assert_eq!(
                    frames,
                    vec![Frame::Subscribe {
                        symbol: "EURUSD".into()
                    }]
                );
            }
            _ => panic!("expected an upstream SUBSCRIBE"),
        }
        assert_eq!(mgr.routes.len(), 1);
    }

    #[test]
    fn subscribe_then_unsubscribe_restores_observable_state() {
        let mut mgr = manager();
        let (sink, _rx) = sink_pair(&mgr.metrics);
        let id = Uuid::new_v4();

        mgr.apply_command(
            FeedCommand::Subscribe {
                id,
                symbol: "EURUSD".into(),
                sink,
            },
            0,
        );
        let effect = mgr.apply_command(
            FeedCommand::Unsubscribe {
                id,
                symbol: "EURUSD".into(),
            },
            0,
        );
        match effect {
            CommandEffect::Send(frames) => {
                assert_eq!(
                    frames,
                    vec![Frame::Unsubscribe {
                        symbol: "EURUSD".into()
                    }]
                );
            }
            _ => panic!("expected an upstream UNSUBSCRIBE"),
        }
        // Back to the pre-subscribe state: no routes, no cached descriptor.
        assert!(mgr.routes.is_empty());
    }

    #[test]
    fn second_subscriber_shares_the_symbol() {
        let mut mgr = manager();
        let (sink_a, mut rx_a) = sink_pair(&mgr.metrics);
        let (sink_b, mut rx_b) = sink_pair(&mgr.metrics);

        mgr.apply_command(
            FeedCommand::Subscribe {
                id: Uuid::new_v4(),
                symbol: "EURUSD".into(),
                sink: sink_a,
            },
            0,
        );
        mgr.dispatch(Frame::Snapshot(snapshot("EURUSD")), 0);
        assert!(matches!(rx_a.try_recv(), Some(FeedEvent::Initialized(_))));

        // Second subscriber: no upstream traffic, cached snapshot delivered.
        let effect = mgr.apply_command(
            FeedCommand::Subscribe {
                id: Uuid::new_v4(),
                symbol: "EURUSD".into(),
                sink: sink_b,
            },
            0,
        );
        assert!(matches!(effect, CommandEffect::Quiet));
        assert!(matches!(rx_b.try_recv(), Some(FeedEvent::Initialized(_))));
    }

    #[test]
    fn unsubscribe_with_remaining_subscriber_keeps_route() {
        let mut mgr = manager();
        let (sink_a, _rx_a) = sink_pair(&mgr.metrics);
        let (sink_b, _rx_b) = sink_pair(&mgr.metrics);
        let id_a = Uuid::new_v4();

        mgr.apply_command(
            FeedCommand::Subscribe {
                id: id_a,
                symbol: "EURUSD".into(),
                sink: sink_a,
            },
            0,
        );
        mgr.apply_command(
            FeedCommand::Subscribe {
                id: Uuid::new_v4(),
                symbol: "EURUSD".into(),
                sink: sink_b,
            },
            0,
        );

        let effect = mgr.apply_command(
            FeedCommand::Unsubscribe {
                id: id_a,
                symbol: "EURUSD".into(),
            },
            0,
        );
        assert!(matches!(effect, CommandEffect::Quiet));
        assert_eq!(mgr.routes.len(), 1);
    }

    #[test]
    fn ticks_route_only_to_their_symbol() {
        let mut mgr = manager();
        let (sink_eur, mut rx_eur) = sink_pair(&mgr.metrics);
        let (sink_gbp, mut rx_gbp) = sink_pair(&mgr.metrics);

        mgr.apply_command(
            FeedCommand::Subscribe {
                id: Uuid::new_v4(),
                symbol: "EURUSD".into(),
                sink: sink_eur,
            },
            0,
        );
        mgr.apply_command(
            FeedCommand::Subscribe {
                id: Uuid::new_v4(),
                symbol: "GBPUSD".into(),
                sink: sink_gbp,
            },
            0,
        );

        mgr.dispatch(tick_frame("EURUSD", 1), 1);
        mgr.dispatch(tick_frame("EURUSD", 2), 2);

        assert!(matches!(rx_eur.try_recv(), Some(FeedEvent::Tick(t)) if t.timestamp_ms == 1));
        assert!(matches!(rx_eur.try_recv(), Some(FeedEvent::Tick(t)) if t.timestamp_ms == 2));
        assert!(rx_gbp.try_recv().is_none());
        assert_eq!(mgr.metrics.ticks_routed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn per_symbol_tick_order_is_preserved() {
        let mut mgr = manager();
        let (sink, mut rx) = sink_pair(&mgr.metrics);
        mgr.apply_command(
            FeedCommand::Subscribe {
                id: Uuid::new_v4(),
                symbol: "EURUSD".into(),
                sink,
            },
            0,
        );
        for ts in 0..20 {
            mgr.dispatch(tick_frame("EURUSD", ts), ts);
        }
        let mut prev = -1;
        while let Some(FeedEvent::Tick(t)) = rx.try_recv() {
            assert!(t.timestamp_ms > prev);
            prev = t.timestamp_ms;
        }
        assert_eq!(prev, 19);
    }

    #[test]
    fn symbol_error_reaches_only_that_symbol() {
        let mut mgr = manager();
        let (sink_eur, mut rx_eur) = sink_pair(&mgr.metrics);
        let (sink_gbp, mut rx_gbp) = sink_pair(&mgr.metrics);

        mgr.apply_command(
            FeedCommand::Subscribe {
                id: Uuid::new_v4(),
                symbol: "EURUSD".into(),
                sink: sink_eur,
            },
            0,
        );
        mgr.apply_command(
            FeedCommand::Subscribe {
                id: Uuid::new_v4(),
                symbol: "GBPUSD".into(),
                sink: sink_gbp,
            },
            0,
        );

        let exit = mgr.dispatch(
            Frame::Error {
                code: "symbol_unknown".into(),
                message: "no such instrument".into(),
                symbol: Some("EURUSD".into()),
            },
            0,
        );
        assert!(exit.is_none());
        assert!(matches!(
            rx_eur.try_recv(),
            Some(FeedEvent::Error(FeedError::SymbolUnknown { .. }))
        ));
        assert!(rx_gbp.try_recv().is_none());
    }

    #[test]
    fn auth_error_is_fatal() {
        let mut mgr = manager();
        let exit = mgr.dispatch(
            Frame::Error {
                code: "auth_failed".into(),
                message: "token expired".into(),
                symbol: None,
            },
            0,
        );
        assert!(matches!(
            exit,
            Some(ServeExit::Fatal(FeedError::AuthFailed { .. }))
        ));
    }

    #[test]
    fn heartbeat_updates_liveness() {
        let mut mgr = manager();
        mgr.dispatch(Frame::Heartbeat { timestamp_ms: 123 }, 5_000);
        assert_eq!(mgr.metrics.last_heartbeat_ms.load(Ordering::Relaxed), 5_000);
    }

    #[test]
    fn snapshot_timeout_is_surfaced_once() {
        let mut mgr = manager();
        let (sink, mut rx) = sink_pair(&mgr.metrics);
        mgr.apply_command(
            FeedCommand::Subscribe {
                id: Uuid::new_v4(),
                symbol: "EURUSD".into(),
                sink,
            },
            0,
        );

        // Not yet expired.
        mgr.check_pending(9_000);
        assert!(rx.try_recv().is_none());

        mgr.check_pending(11_000);
        assert!(matches!(
            rx.try_recv(),
            Some(FeedEvent::Error(FeedError::InitialSnapshotTimeout { .. }))
        ));

        // Only once per pending wait.
        mgr.check_pending(15_000);
        assert!(rx.try_recv().is_none());

        // The subscription stayed pending; a late snapshot still initialises.
        mgr.dispatch(Frame::Snapshot(snapshot("EURUSD")), 20_000);
        assert!(matches!(rx.try_recv(), Some(FeedEvent::Initialized(_))));
    }

    #[test]
    fn broadcast_error_reaches_every_sink() {
        let mut mgr = manager();
        let (sink_a, mut rx_a) = sink_pair(&mgr.metrics);
        let (sink_b, mut rx_b) = sink_pair(&mgr.metrics);
        mgr.apply_command(
            FeedCommand::Subscribe {
                id: Uuid::new_v4(),
                symbol: "EURUSD".into(),
                sink: sink_a,
            },
            0,
        );
        mgr.apply_command(
            FeedCommand::Subscribe {
                id: Uuid::new_v4(),
                symbol: "GBPUSD".into(),
                sink: sink_b,
            },
            0,
        );

        mgr.broadcast_error(FeedError::ConnectionLost { attempts: 5 });
        assert!(matches!(
            rx_a.try_recv(),
            Some(FeedEvent::Error(FeedError::ConnectionLost { attempts: 5 }))
        ));
        assert!(matches!(
            rx_b.try_recv(),
            Some(FeedEvent::Error(FeedError::ConnectionLost { attempts: 5 }))
        ));
    }

    #[test]
    fn backoff_ceiling_doubles_to_the_cap() {
        assert_eq!(backoff_ceiling(1, 500, 30_000), 500);
        assert_eq!(backoff_ceiling(2, 500, 30_000), 1_000);
        assert_eq!(backoff_ceiling(3, 500, 30_000), 2_000);
        assert_eq!(backoff_ceiling(7, 500, 30_000), 30_000);
        assert_eq!(backoff_ceiling(60, 500, 30_000), 30_000);
    }

    #[test]
    fn backoff_delay_stays_within_the_ceiling() {
        for attempt in 1..12 {
            for _ in 0..50 {
                let delay = backoff_delay(attempt, 500, 30_000);
                assert!(delay.as_millis() as u64 <= backoff_ceiling(attempt, 500, 30_000));
            }
        }
    }
}
