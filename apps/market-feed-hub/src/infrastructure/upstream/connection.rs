//! Connection Actor
//!
//! One long-lived task per upstream source. The task exclusively owns the
//! socket and the connection state; everything else talks to it through a
//! cloneable [`ConnectionHandle`].
//!
//! # State Machine
//!
//! ```text
//! Disconnected --start()--> Connecting --open--> Open --close/error--> Disconnected
//!       ^                        |                 |
//!       |                        +--fail-----------+--> retry after delay
//!       +-- budget exhausted: terminal, waits for a manual start()
//! ```
//!
//! On every open the actor sends the dialect's bootstrap frames and then
//! the frames returned by the registered [`ReconnectHook`], before it
//! processes any queued command. Within one socket session the actor also
//! filters subscribe/unsubscribe frames against the set of keys already
//! sent, so a replay racing a live subscribe never reaches upstream twice.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use super::codec::{Decoded, FeedProtocol};
use super::heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{StreamConnector, StreamTransport, TransportSink};
use crate::domain::market::{Namespace, SubscriptionKey};
use crate::domain::subscription::{OutboundFrame, ReconnectHook, UpstreamSink};
use crate::infrastructure::metrics;

// =============================================================================
// Error Type
// =============================================================================

/// Errors returned by [`ConnectionHandle`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// A connection is already being established or is open.
    #[error("connection already {0}")]
    AlreadyActive(ConnectionPhase),
    /// The actor has been stopped.
    #[error("connection actor stopped")]
    Stopped,
}

// =============================================================================
// Status
// =============================================================================

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// No socket.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Socket open and streaming.
    Open,
    /// Shutting the socket down.
    Closing,
}

impl ConnectionPhase {
    /// Phase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }

    /// Numeric value for gauges.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Open => 2.0,
            Self::Closing => 3.0,
        }
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Current phase.
    pub phase: ConnectionPhase,
    /// Reconnect attempts since the last successful open.
    pub retries: u32,
    /// When the next reconnect attempt is scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Retry budget exhausted; no automatic attempt will follow.
    pub terminal: bool,
    /// Reason for the last disconnect.
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    /// Whether a new connection attempt would be refused.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self.phase,
            ConnectionPhase::Connecting | ConnectionPhase::Open
        )
    }
}

// =============================================================================
// Events
// =============================================================================

/// Events a connection reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Socket opened.
    Connected,
    /// Socket closed, failed, or could not be opened.
    Disconnected {
        /// Why.
        reason: String,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// Attempt number since the last successful open.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Retry budget exhausted. Emitted once per exhaustion.
    Unavailable {
        /// Attempts made.
        attempts: u32,
    },
    /// Decoded prices and bars, in arrival order.
    Decoded(Decoded),
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration of one connection actor.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Namespace of the source, used for logs and metrics.
    pub namespace: Namespace,
    /// Streaming endpoint.
    pub url: String,
    /// Retry policy.
    pub reconnect: ReconnectConfig,
    /// Heartbeat policy.
    pub heartbeat: HeartbeatConfig,
}

// =============================================================================
// Handle
// =============================================================================

enum Command {
    Start,
    Send(OutboundFrame),
}

type HookSlot = Arc<RwLock<Option<Weak<dyn ReconnectHook>>>>;

/// Control surface of a running connection actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    namespace: Namespace,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    hook: HookSlot,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Spawn an idle actor. Nothing connects until [`start`](Self::start).
    #[must_use]
    pub fn spawn(
        config: ConnectionConfig,
        protocol: Arc<dyn FeedProtocol>,
        connector: Arc<dyn StreamConnector>,
        events: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let hook: HookSlot = Arc::new(RwLock::new(None));

        let actor = ConnectionActor {
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            config,
            protocol,
            connector,
            events,
            commands: commands_rx,
            status: status_tx,
            hook: Arc::clone(&hook),
            cancel: cancel.clone(),
        };

        let namespace = actor.config.namespace.clone();
        tokio::spawn(actor.run());

        Self {
            namespace,
            commands: commands_tx,
            status: status_rx,
            hook,
            cancel,
        }
    }

    /// Register the hook asked for replay frames on every open.
    pub fn set_reconnect_hook(&self, hook: Weak<dyn ReconnectHook>) {
        *self.hook.write() = Some(hook);
    }

    /// Begin connecting.
    ///
    /// Also resumes a connection whose retry budget was exhausted, and cuts
    /// a pending reconnect delay short.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::AlreadyActive`] while connecting or open,
    /// [`ConnectionError::Stopped`] after [`stop`](Self::stop).
    pub fn start(&self) -> Result<(), ConnectionError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectionError::Stopped);
        }
        let phase = self.status.borrow().phase;
        if matches!(phase, ConnectionPhase::Connecting | ConnectionPhase::Open) {
            return Err(ConnectionError::AlreadyActive(phase));
        }
        self.commands
            .send(Command::Start)
            .map_err(|_| ConnectionError::Stopped)
    }

    /// Tear the socket down and cancel every timer. The actor exits.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Status updates.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Namespace of the source.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }
}

impl UpstreamSink for ConnectionHandle {
    /// Queue a frame. Dropped with a warning unless the connection is open;
    /// the subscription registry replays intent on the next open.
    fn send(&self, frame: OutboundFrame) {
        let phase = self.status.borrow().phase;
        if phase != ConnectionPhase::Open {
            tracing::warn!(
                namespace = %self.namespace,
                phase = %phase,
                frame = ?frame,
                "Connection not open, dropping outbound frame"
            );
            metrics::record_frame_dropped(self.namespace.as_str());
            return;
        }
        if self.commands.send(Command::Send(frame)).is_err() {
            tracing::debug!(namespace = %self.namespace, "Connection actor gone, frame dropped");
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("namespace", &self.namespace)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Actor
// =============================================================================

enum SessionEnd {
    Stopped,
    Failed(String),
}

enum Wake {
    Elapsed,
    Start,
    Stop,
}

struct ConnectionActor {
    config: ConnectionConfig,
    protocol: Arc<dyn FeedProtocol>,
    connector: Arc<dyn StreamConnector>,
    events: mpsc::Sender<FeedEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ConnectionStatus>,
    hook: HookSlot,
    cancel: CancellationToken,
    policy: ReconnectPolicy,
}

impl ConnectionActor {
    async fn run(mut self) {
        let ns = self.config.namespace.clone();
        tracing::debug!(namespace = %ns, url = %self.config.url, "Connection actor started");

        'idle: loop {
            if matches!(self.wait_for_start().await, Wake::Stop) {
                break 'idle;
            }

            self.status.send_modify(|s| {
                s.terminal = false;
                s.retries = 0;
            });
            self.policy.reset();

            loop {
                let reason = match self.connect_once().await {
                    SessionEnd::Stopped => break 'idle,
                    SessionEnd::Failed(reason) => reason,
                };

                tracing::warn!(namespace = %ns, reason = %reason, "Upstream connection lost");
                self.set_phase(ConnectionPhase::Disconnected);
                self.status
                    .send_modify(|s| s.last_error = Some(reason.clone()));
                self.emit(FeedEvent::Disconnected { reason }).await;

                let Some(delay) = self.policy.next_delay() else {
                    let attempts = self.policy.attempts();
                    tracing::error!(
                        namespace = %ns,
                        attempts,
                        "Retry budget exhausted, feed unavailable"
                    );
                    self.status.send_modify(|s| {
                        s.terminal = true;
                        s.next_retry_at = None;
                    });
                    metrics::record_feed_unavailable(ns.as_str());
                    self.emit(FeedEvent::Unavailable { attempts }).await;
                    continue 'idle;
                };

                let attempt = self.policy.attempts();
                tracing::info!(
                    namespace = %ns,
                    attempt,
                    delay_ms = delay.as_millis(),
                    "Scheduling reconnect"
                );
                self.status.send_modify(|s| {
                    s.retries = attempt;
                    s.next_retry_at = chrono::Duration::from_std(delay)
                        .ok()
                        .map(|d| Utc::now() + d);
                });
                metrics::record_reconnect(ns.as_str());
                self.emit(FeedEvent::Reconnecting { attempt, delay }).await;

                match self.sleep_or_wake(delay).await {
                    Wake::Stop => break 'idle,
                    Wake::Elapsed | Wake::Start => {}
                }
            }
        }

        self.set_phase(ConnectionPhase::Disconnected);
        self.status.send_modify(|s| s.next_retry_at = None);
        tracing::debug!(namespace = %ns, "Connection actor stopped");
    }

    /// Wait in `Disconnected` until asked to connect.
    async fn wait_for_start(&mut self) -> Wake {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Wake::Stop,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Start) => return Wake::Start,
                    Some(Command::Send(frame)) => self.drop_frame(&frame),
                    None => return Wake::Stop,
                },
            }
        }
    }

    /// Wait out a reconnect delay. A manual start skips the remainder.
    async fn sleep_or_wake(&mut self, delay: Duration) -> Wake {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Wake::Stop,
                () = &mut sleep => return Wake::Elapsed,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Start) => return Wake::Start,
                    Some(Command::Send(frame)) => self.drop_frame(&frame),
                    None => return Wake::Stop,
                },
            }
        }
    }

    async fn connect_once(&mut self) -> SessionEnd {
        self.set_phase(ConnectionPhase::Connecting);
        tracing::info!(
            namespace = %self.config.namespace,
            url = %self.config.url,
            "Connecting to upstream"
        );

        let connector = Arc::clone(&self.connector);
        let result = tokio::select! {
            () = self.cancel.cancelled() => return SessionEnd::Stopped,
            result = connector.connect(&self.config.url) => result,
        };

        match result {
            Ok(transport) => self.run_session(transport).await,
            Err(e) => SessionEnd::Failed(format!("connect failed: {e}")),
        }
    }

    async fn run_session(&mut self, transport: StreamTransport) -> SessionEnd {
        let StreamTransport {
            mut sink,
            mut stream,
        } = transport;
        let ns = self.config.namespace.clone();

        self.policy.reset();
        self.status.send_modify(|s| {
            s.phase = ConnectionPhase::Open;
            s.retries = 0;
            s.next_retry_at = None;
            s.terminal = false;
            s.last_error = None;
        });
        metrics::set_connection_phase(ns.as_str(), ConnectionPhase::Open);
        tracing::info!(namespace = %ns, "Upstream connection open");
        self.emit(FeedEvent::Connected).await;

        let mut session: HashSet<SubscriptionKey> = HashSet::new();
        if let Err(e) = self.restore(&mut sink, &mut session).await {
            return SessionEnd::Failed(format!("restore failed: {e}"));
        }

        let mut monitor = HeartbeatMonitor::new(self.config.heartbeat.clone());
        let mut ticker = self.config.heartbeat.ticker();

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    self.set_phase(ConnectionPhase::Closing);
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    return SessionEnd::Stopped;
                }
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(frame)) => {
                        if let Err(e) = self.write_frame(&mut sink, &mut session, frame).await {
                            return SessionEnd::Failed(format!("write failed: {e}"));
                        }
                    }
                    Some(Command::Start) => {
                        tracing::debug!(namespace = %ns, "Start ignored, already open");
                    }
                    None => return SessionEnd::Stopped,
                },
                _ = ticker.tick() => match monitor.on_tick() {
                    HeartbeatAction::SendPing => {
                        if let Err(e) = self.write_frame(&mut sink, &mut session, OutboundFrame::Heartbeat).await {
                            return SessionEnd::Failed(format!("heartbeat write failed: {e}"));
                        }
                    }
                    HeartbeatAction::TimedOut { silent_for } => {
                        tracing::warn!(
                            namespace = %ns,
                            silent_secs = silent_for.as_secs(),
                            "Heartbeat timeout"
                        );
                        return SessionEnd::Failed("heartbeat timeout".to_string());
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        monitor.record_activity();
                        self.handle_text(text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        monitor.record_activity();
                        match std::str::from_utf8(&bytes) {
                            Ok(text) => self.handle_text(text).await,
                            Err(_) => metrics::record_decode_dropped(ns.as_str()),
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                        monitor.record_activity();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "closed by upstream".to_string(),
                            |f| format!("closed by upstream: {} {}", f.code, f.reason.as_str()),
                        );
                        return SessionEnd::Failed(reason);
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                    None => return SessionEnd::Failed("stream ended".to_string()),
                },
            }
        }
    }

    /// Bootstrap frames, then the hook's replay, before any queued command.
    async fn restore(
        &self,
        sink: &mut TransportSink,
        session: &mut HashSet<SubscriptionKey>,
    ) -> Result<(), WsError> {
        let ns = self.config.namespace.as_str();

        for text in self.protocol.bootstrap_frames() {
            sink.send(Message::text(text)).await?;
            metrics::record_upstream_frame(ns, "bootstrap");
        }

        let hook = self.hook.read().as_ref().and_then(Weak::upgrade);
        let replay = hook.map(|h| h.replay()).unwrap_or_default();
        if !replay.is_empty() {
            tracing::info!(namespace = %ns, frames = replay.len(), "Replaying subscriptions");
        }
        for frame in replay {
            self.write_frame(sink, session, frame).await?;
        }
        Ok(())
    }

    async fn write_frame(
        &self,
        sink: &mut TransportSink,
        session: &mut HashSet<SubscriptionKey>,
        frame: OutboundFrame,
    ) -> Result<(), WsError> {
        let kind = match &frame {
            OutboundFrame::Subscribe(key) => {
                if !session.insert(key.clone()) {
                    return Ok(());
                }
                "subscribe"
            }
            OutboundFrame::Unsubscribe(key) => {
                if !session.remove(key) {
                    return Ok(());
                }
                "unsubscribe"
            }
            OutboundFrame::Heartbeat => "heartbeat",
        };

        let Some(message) = self.protocol.encode(&frame) else {
            tracing::trace!(frame = ?frame, "Frame has no wire form in this dialect");
            return Ok(());
        };

        sink.send(message).await?;
        metrics::record_upstream_frame(self.config.namespace.as_str(), kind);
        Ok(())
    }

    async fn handle_text(&self, text: &str) {
        let ns = self.config.namespace.as_str();
        metrics::record_frame_received(ns);

        if self.protocol.is_heartbeat_ack(text) {
            return;
        }
        match self.protocol.decode(text) {
            Some(decoded) => self.emit(FeedEvent::Decoded(decoded)).await,
            None => {
                metrics::record_decode_dropped(ns);
                tracing::trace!(namespace = %ns, len = text.len(), "Dropped undecodable frame");
            }
        }
    }

    fn drop_frame(&self, frame: &OutboundFrame) {
        tracing::debug!(
            namespace = %self.config.namespace,
            frame = ?frame,
            "Connection not open, dropping queued frame"
        );
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        self.status.send_modify(|s| s.phase = phase);
        metrics::set_connection_phase(self.config.namespace.as_str(), phase);
    }

    async fn emit(&self, event: FeedEvent) {
        if self.events.send(event).await.is_err() {
            tracing::trace!(namespace = %self.config.namespace, "Feed event receiver dropped");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
