//! Market Data Service
//!
//! The consumer-facing surface of the hub. A [`MarketDataService`] owns the
//! configured sources; consumers [`attach`](MarketDataService::attach) to
//! get a [`ClientHandle`] for snapshots, bar and price subscriptions, and
//! hub events.
//!
//! # Lifecycle
//!
//! The first attached client starts every source: one connection actor,
//! aggregator, multiplexer and router per namespace, a seed fetch where a
//! snapshot endpoint exists, and the snapshot emitter. Dropping the last
//! client cancels all of it. Attaching again starts fresh.
//!
//! ```text
//! attach() ──► clients 0→1 ──► FeedRuntime::start
//! drop(handle) ──► clients 1→0 ──► cancel
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::emitter::SnapshotEmitter;
use super::feed_router::FeedRouter;
use crate::application::ports::{SnapshotSource, StreamConnector};
use crate::domain::market::{
    BarEvent, MarketEvent, Namespace, PriceSnapshot, PriceUpdate, Resolution, SubscriptionKey,
};
use crate::domain::prices::{PriceAggregator, SeedState};
use crate::domain::subscription::{
    EventHandler, MultiplexerStats, ReconnectHook, SubscriberId, SubscriptionMultiplexer,
};
use crate::infrastructure::broadcast::{EndpointId, FanoutHub, HubEvent};
use crate::infrastructure::config::{Dialect, FeedConfig, HubSettings, MarketDirectory};
use crate::infrastructure::metrics;
use crate::infrastructure::upstream::{
    ConnectionConfig, ConnectionError, ConnectionHandle, ConnectionStatus, HeartbeatConfig,
    ReconnectConfig, protocol_for,
};

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by [`ClientHandle`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarketDataError {
    /// The namespace is not configured.
    #[error("unknown namespace: {0}")]
    UnknownNamespace(Namespace),
    /// No configured source can stream bars.
    #[error("no bar source configured")]
    NoBarSource,
    /// The hub is not running.
    #[error("market data service is not running")]
    NotRunning,
    /// The connection refused the request.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

// =============================================================================
// Feed Runtime
// =============================================================================

struct Feed {
    connection: ConnectionHandle,
    aggregator: Arc<PriceAggregator>,
    multiplexer: Arc<SubscriptionMultiplexer>,
}

/// Everything running while at least one client is attached.
struct FeedRuntime {
    feeds: HashMap<Namespace, Feed>,
    cancel: CancellationToken,
}

impl FeedRuntime {
    fn start(shared: &Shared, cancel: CancellationToken) -> Self {
        let websocket = &shared.settings.websocket;
        let mut feeds = HashMap::new();

        for feed in &shared.directory.feeds {
            let namespace = feed.namespace.clone();
            let (events_tx, events_rx) =
                mpsc::channel(shared.settings.fanout.feed_event_capacity.max(1));

            let connection = ConnectionHandle::spawn(
                ConnectionConfig {
                    namespace: namespace.clone(),
                    url: feed.stream_url.clone(),
                    reconnect: ReconnectConfig::from_websocket_settings(websocket),
                    heartbeat: HeartbeatConfig::from_websocket_settings(websocket),
                },
                protocol_for(feed),
                Arc::clone(&shared.connector),
                events_tx,
                cancel.child_token(),
            );

            let multiplexer = Arc::new(SubscriptionMultiplexer::new(Arc::new(connection.clone())));
            let hook: Arc<dyn ReconnectHook> = multiplexer.clone();
            connection.set_reconnect_hook(Arc::downgrade(&hook));

            let aggregator = Arc::new(if feed.snapshot_url.is_some() {
                PriceAggregator::awaiting_seed(namespace.clone())
            } else {
                PriceAggregator::without_seed(namespace.clone())
            });

            let router = FeedRouter::new(
                namespace.clone(),
                Arc::clone(&aggregator),
                Arc::clone(&multiplexer),
                Arc::clone(&shared.hub),
                connection.watch_status(),
            );
            tokio::spawn(router.run(events_rx, cancel.child_token()));

            if feed.snapshot_url.is_some() {
                tokio::spawn(seed(
                    namespace.clone(),
                    Arc::clone(&aggregator),
                    Arc::clone(&shared.snapshots),
                    shared.settings.server.snapshot_timeout,
                    cancel.child_token(),
                ));
            }

            if let Err(e) = connection.start() {
                tracing::error!(namespace = %namespace, error = %e, "Failed to start feed");
            }

            feeds.insert(
                namespace,
                Feed {
                    connection,
                    aggregator,
                    multiplexer,
                },
            );
        }

        let aggregators = feeds.values().map(|f| Arc::clone(&f.aggregator)).collect();
        let emitter = SnapshotEmitter::new(
            aggregators,
            Arc::clone(&shared.hub),
            shared.settings.fanout.emit_interval,
        );
        tokio::spawn(emitter.run(cancel.child_token()));

        tracing::info!(feeds = feeds.len(), "Market data feeds started");
        Self { feeds, cancel }
    }

    fn stop(&self) {
        self.cancel.cancel();
        tracing::info!(feeds = self.feeds.len(), "Market data feeds stopped");
    }

    fn upstream_key_count(&self) -> usize {
        self.feeds
            .values()
            .map(|f| f.multiplexer.stats().upstream_count)
            .sum()
    }
}

/// Fetch the seed snapshot for one namespace.
async fn seed(
    namespace: Namespace,
    aggregator: Arc<PriceAggregator>,
    source: Arc<dyn SnapshotSource>,
    timeout: std::time::Duration,
    cancel: CancellationToken,
) {
    let fetch = tokio::time::timeout(timeout, source.fetch(&namespace));
    let result = tokio::select! {
        () = cancel.cancelled() => return,
        result = fetch => result,
    };

    match result {
        Ok(Ok(batch)) => {
            aggregator.seed(batch);
        }
        Ok(Err(e)) => {
            tracing::warn!(namespace = %namespace, error = %e, "Snapshot fetch failed");
            aggregator.mark_seed_failed();
        }
        Err(_) => {
            tracing::warn!(
                namespace = %namespace,
                timeout_ms = timeout.as_millis(),
                "Snapshot fetch timed out"
            );
            aggregator.mark_seed_failed();
        }
    }
}

// =============================================================================
// Service
// =============================================================================

struct Lifecycle {
    clients: usize,
    runtime: Option<FeedRuntime>,
}

struct Shared {
    settings: HubSettings,
    directory: MarketDirectory,
    connector: Arc<dyn StreamConnector>,
    snapshots: Arc<dyn SnapshotSource>,
    hub: Arc<FanoutHub>,
    lifecycle: Mutex<Lifecycle>,
    shutdown: CancellationToken,
}

impl Shared {
    fn with_feed<T>(&self, namespace: &Namespace, f: impl FnOnce(&Feed) -> T) -> Option<T> {
        let lifecycle = self.lifecycle.lock();
        lifecycle
            .runtime
            .as_ref()
            .and_then(|runtime| runtime.feeds.get(namespace))
            .map(f)
    }

    fn release(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.clients = lifecycle.clients.saturating_sub(1);
        if lifecycle.clients == 0
            && let Some(runtime) = lifecycle.runtime.take()
        {
            runtime.stop();
            metrics::set_active_keys(0);
        }
    }

    fn refresh_active_keys(&self) {
        let count = self
            .lifecycle
            .lock()
            .runtime
            .as_ref()
            .map_or(0, FeedRuntime::upstream_key_count);
        metrics::set_active_keys(count);
    }
}

/// Per-namespace summary for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct FeedSummary {
    /// Source namespace.
    pub namespace: Namespace,
    /// Wire dialect.
    pub dialect: Dialect,
    /// Connection status (default while stopped).
    pub status: ConnectionStatus,
    /// Seed state of the aggregator, if running.
    pub seed: Option<SeedState>,
    /// Symbols with a known price.
    pub symbols: usize,
    /// Subscription statistics of the source.
    pub subscriptions: SubscriptionSummary,
}

/// Subscription counters of one source.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SubscriptionSummary {
    /// Keys subscribed upstream.
    pub upstream_keys: usize,
    /// Registered handlers.
    pub handlers: usize,
    /// Handler panics caught.
    pub handler_panics: u64,
}

impl From<MultiplexerStats> for SubscriptionSummary {
    fn from(stats: MultiplexerStats) -> Self {
        Self {
            upstream_keys: stats.upstream_count,
            handlers: stats.handler_count,
            handler_panics: stats.handler_panics,
        }
    }
}

/// Owner of every configured upstream source.
///
/// Cheap to clone; clones share the same sources and clients.
#[derive(Clone)]
pub struct MarketDataService {
    shared: Arc<Shared>,
}

impl MarketDataService {
    /// Create a service. Nothing connects until the first [`attach`](Self::attach).
    #[must_use]
    pub fn new(
        settings: HubSettings,
        directory: MarketDirectory,
        connector: Arc<dyn StreamConnector>,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                directory,
                connector,
                snapshots,
                hub: Arc::new(FanoutHub::new()),
                lifecycle: Mutex::new(Lifecycle {
                    clients: 0,
                    runtime: None,
                }),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Attach a consumer. The first attach starts every source.
    #[must_use]
    pub fn attach(&self) -> ClientHandle {
        let shared = &self.shared;
        {
            let mut lifecycle = shared.lifecycle.lock();
            lifecycle.clients += 1;
            if lifecycle.runtime.is_none() && !shared.shutdown.is_cancelled() {
                lifecycle.runtime = Some(FeedRuntime::start(shared, shared.shutdown.child_token()));
            }
            tracing::debug!(clients = lifecycle.clients, "Client attached");
        }

        let endpoint = shared.hub.register(shared.settings.fanout.endpoint_capacity);
        ClientHandle {
            shared: Arc::clone(shared),
            endpoint_id: endpoint.id,
            events: Some(endpoint.rx),
            subscriptions: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Stop every source for good. Later attaches do not restart them.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        if let Some(runtime) = self.shared.lifecycle.lock().runtime.take() {
            runtime.stop();
        }
    }

    /// Whether the sources are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.lifecycle.lock().runtime.is_some()
    }

    /// Attached clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.lifecycle.lock().clients
    }

    /// Configured market directory.
    #[must_use]
    pub fn directory(&self) -> &MarketDirectory {
        &self.shared.directory
    }

    /// Current price map of `namespace`, `None` when it is not configured.
    #[must_use]
    pub fn snapshot(&self, namespace: &Namespace) -> Option<PriceSnapshot> {
        self.shared.directory.feed(namespace)?;
        Some(
            self.shared
                .with_feed(namespace, |feed| feed.aggregator.snapshot())
                .unwrap_or_default(),
        )
    }

    /// Summary of every configured source, in directory order.
    #[must_use]
    pub fn feed_summaries(&self) -> Vec<FeedSummary> {
        self.shared
            .directory
            .feeds
            .iter()
            .map(|config| self.summary(config))
            .collect()
    }

    /// Registered fan-out endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.shared.hub.endpoint_count()
    }

    fn summary(&self, config: &FeedConfig) -> FeedSummary {
        self.shared
            .with_feed(&config.namespace, |feed| FeedSummary {
                namespace: config.namespace.clone(),
                dialect: config.dialect,
                status: feed.connection.status(),
                seed: Some(feed.aggregator.seed_state()),
                symbols: feed.aggregator.len(),
                subscriptions: feed.multiplexer.stats().into(),
            })
            .unwrap_or_else(|| FeedSummary {
                namespace: config.namespace.clone(),
                dialect: config.dialect,
                status: ConnectionStatus::default(),
                seed: None,
                symbols: 0,
                subscriptions: SubscriptionSummary::default(),
            })
    }
}

impl std::fmt::Debug for MarketDataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataService")
            .field("feeds", &self.shared.directory.feeds.len())
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

type OwnedSubscriptions = Arc<Mutex<HashSet<SubscriberId>>>;

/// Explicit handle of one bar or price subscription.
///
/// [`cancel`](Self::cancel) unsubscribes. Dropping the handle without
/// cancelling unsubscribes as well.
#[must_use = "dropping a subscription handle unsubscribes it"]
pub struct BarSubscription {
    id: SubscriberId,
    key: SubscriptionKey,
    multiplexer: Weak<SubscriptionMultiplexer>,
    owner: Weak<Mutex<HashSet<SubscriberId>>>,
    shared: Weak<Shared>,
    active: bool,
}

/// Handle returned by [`ClientHandle::watch_price`].
pub type PriceWatch = BarSubscription;

impl BarSubscription {
    /// Subscriber id, also accepted by [`ClientHandle::unsubscribe_bars`].
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribed key.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Unsubscribe. Returns the number of handlers removed.
    pub fn cancel(mut self) -> usize {
        self.release()
    }

    fn release(&mut self) -> usize {
        if !self.active {
            return 0;
        }
        self.active = false;

        if let Some(owner) = self.owner.upgrade() {
            owner.lock().remove(&self.id);
        }
        let removed = self
            .multiplexer
            .upgrade()
            .map_or(0, |mux| mux.unsubscribe(&self.id));
        if let Some(shared) = self.shared.upgrade() {
            shared.refresh_active_keys();
        }
        removed
    }
}

impl Drop for BarSubscription {
    fn drop(&mut self) {
        if self.active {
            tracing::debug!(
                subscriber = %self.id,
                key = %self.key,
                "Subscription handle dropped without cancel, unsubscribing"
            );
            self.release();
        }
    }
}

impl std::fmt::Debug for BarSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarSubscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Client Handle
// =============================================================================

/// One attached consumer.
///
/// Dropping the handle unregisters its fan-out endpoint, cancels every
/// subscription it made, and releases its hold on the sources.
pub struct ClientHandle {
    shared: Arc<Shared>,
    endpoint_id: EndpointId,
    events: Option<mpsc::Receiver<HubEvent>>,
    subscriptions: OwnedSubscriptions,
}

impl ClientHandle {
    /// Current price map of `namespace`. Empty when unknown.
    #[must_use]
    pub fn get_snapshot(&self, namespace: &Namespace) -> PriceSnapshot {
        self.shared
            .with_feed(namespace, |feed| feed.aggregator.snapshot())
            .unwrap_or_default()
    }

    /// Latest price of one symbol.
    #[must_use]
    pub fn get_price(&self, namespace: &Namespace, symbol: &str) -> Option<f64> {
        self.shared
            .with_feed(namespace, |feed| feed.aggregator.price(symbol))
            .flatten()
    }

    /// Stream bars of `symbol` at `resolution` from the bar source.
    ///
    /// # Errors
    ///
    /// [`MarketDataError::NoBarSource`] when no source streams bars.
    pub fn subscribe_bars<F>(
        &self,
        symbol: &str,
        resolution: Resolution,
        on_bar: F,
    ) -> Result<BarSubscription, MarketDataError>
    where
        F: Fn(&BarEvent) + Send + Sync + 'static,
    {
        let namespace = self
            .shared
            .directory
            .bar_feed()
            .map(|feed| feed.namespace.clone())
            .ok_or(MarketDataError::NoBarSource)?;

        let handler: EventHandler = Arc::new(move |event: &MarketEvent| {
            if let MarketEvent::Bar(bar) = event {
                on_bar(bar);
            }
        });
        self.subscribe(&namespace, SubscriptionKey::bars(symbol, resolution), handler)
    }

    /// Call `on_price` for every streamed price of `symbol` in `namespace`.
    ///
    /// # Errors
    ///
    /// [`MarketDataError::UnknownNamespace`] when the namespace is not
    /// configured.
    pub fn watch_price<F>(
        &self,
        namespace: &Namespace,
        symbol: &str,
        on_price: F,
    ) -> Result<PriceWatch, MarketDataError>
    where
        F: Fn(&PriceUpdate) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(move |event: &MarketEvent| {
            if let MarketEvent::Price(update) = event {
                on_price(update);
            }
        });
        self.subscribe(namespace, SubscriptionKey::price(symbol), handler)
    }

    /// Remove every handler registered under `subscriber`.
    ///
    /// Returns the number of handlers removed; unknown ids remove nothing.
    pub fn unsubscribe_bars(&self, subscriber: &str) -> usize {
        self.subscriptions.lock().remove(subscriber);
        let removed = {
            let lifecycle = self.shared.lifecycle.lock();
            lifecycle.runtime.as_ref().map_or(0, |runtime| {
                runtime
                    .feeds
                    .values()
                    .map(|feed| feed.multiplexer.unsubscribe(subscriber))
                    .sum::<usize>()
            })
        };
        self.shared.refresh_active_keys();
        removed
    }

    /// Next hub event. `None` once the event stream was taken.
    ///
    /// A snapshot that found this client's queue full is skipped; the next
    /// change carries the whole map again and
    /// [`get_snapshot`](Self::get_snapshot) always reads the live one.
    pub async fn next_event(&mut self) -> Option<HubEvent> {
        self.events.as_mut()?.recv().await
    }

    /// Take the hub events as a [`Stream`](futures::Stream).
    ///
    /// The stream ends when the handle is dropped.
    pub fn take_event_stream(&mut self) -> Option<ReceiverStream<HubEvent>> {
        self.events.take().map(ReceiverStream::new)
    }

    /// Connection status of `namespace`.
    #[must_use]
    pub fn feed_status(&self, namespace: &Namespace) -> Option<ConnectionStatus> {
        self.shared
            .with_feed(namespace, |feed| feed.connection.status())
    }

    /// Manually resume a source, typically after its retry budget ran out.
    ///
    /// # Errors
    ///
    /// [`MarketDataError::UnknownNamespace`] for unconfigured namespaces,
    /// [`MarketDataError::Connection`] when the connection is already
    /// active or stopped.
    pub fn restart_feed(&self, namespace: &Namespace) -> Result<(), MarketDataError> {
        let connection = self
            .shared
            .with_feed(namespace, |feed| feed.connection.clone())
            .ok_or_else(|| self.missing(namespace))?;

        tracing::info!(namespace = %namespace, "Manual feed restart requested");
        connection.start().map_err(MarketDataError::from)
    }

    /// Fan-out endpoint of this client.
    #[must_use]
    pub const fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }

    fn subscribe(
        &self,
        namespace: &Namespace,
        key: SubscriptionKey,
        handler: EventHandler,
    ) -> Result<BarSubscription, MarketDataError> {
        let multiplexer = self
            .shared
            .with_feed(namespace, |feed| Arc::clone(&feed.multiplexer))
            .ok_or_else(|| self.missing(namespace))?;

        let id: SubscriberId = Uuid::new_v4().to_string();
        self.subscriptions.lock().insert(id.clone());
        multiplexer.subscribe(key.clone(), id.clone(), handler);
        self.shared.refresh_active_keys();

        tracing::debug!(namespace = %namespace, key = %key, subscriber = %id, "Subscribed");
        Ok(BarSubscription {
            id,
            key,
            multiplexer: Arc::downgrade(&multiplexer),
            owner: Arc::downgrade(&self.subscriptions),
            shared: Arc::downgrade(&self.shared),
            active: true,
        })
    }

    fn missing(&self, namespace: &Namespace) -> MarketDataError {
        if self.shared.directory.feed(namespace).is_some() {
            MarketDataError::NotRunning
        } else {
            MarketDataError::UnknownNamespace(namespace.clone())
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        let ids: Vec<SubscriberId> = self.subscriptions.lock().drain().collect();
        if !ids.is_empty() {
            let lifecycle = self.shared.lifecycle.lock();
            if let Some(runtime) = lifecycle.runtime.as_ref() {
                for id in &ids {
                    for feed in runtime.feeds.values() {
                        feed.multiplexer.unsubscribe(id);
                    }
                }
            }
        }

        self.shared.hub.unregister(self.endpoint_id);
        self.shared.release();
        self.shared.refresh_active_keys();
        tracing::debug!(
            endpoint = %self.endpoint_id,
            subscriptions = ids.len(),
            "Client detached"
        );
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("endpoint", &self.endpoint_id)
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
