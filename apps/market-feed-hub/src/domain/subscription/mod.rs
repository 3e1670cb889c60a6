//! Subscription Multiplexer
//!
//! Reference-counts consumer interest per [`SubscriptionKey`] and decides
//! when an upstream subscribe/unsubscribe frame is needed.
//!
//! # Design
//!
//! The multiplexer tracks:
//! - Which handlers are registered for each key, in registration order
//! - Which keys each subscriber holds, so `unsubscribe` needs only the id
//! - The registry of upstream-subscribed keys, used to replay after reconnect
//!
//! Upstream frames are emitted only on the 0→1 and 1→0 handler transitions
//! of a key, so upstream volume is bounded by the number of distinct keys in
//! use rather than the number of consumers watching them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::domain::market::{MarketEvent, SubscriptionKey};

// =============================================================================
// Types
// =============================================================================

/// Identifier chosen by (or generated for) a consumer subscription.
pub type SubscriberId = String;

/// Consumer callback invoked for every event on a subscribed key.
pub type EventHandler = Arc<dyn Fn(&MarketEvent) + Send + Sync>;

/// Frame the multiplexer (or the heartbeat) asks the connection to send.
///
/// Frames are dialect-neutral; the connection encodes them with its codec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OutboundFrame {
    /// Start streaming a key upstream.
    Subscribe(SubscriptionKey),
    /// Stop streaming a key upstream.
    Unsubscribe(SubscriptionKey),
    /// Application-level keepalive.
    Heartbeat,
}

/// Outbound half of an upstream connection as seen by the multiplexer.
///
/// Implementations must not block: frames are sent while the registry lock
/// is held so their order matches the order of the transitions.
pub trait UpstreamSink: Send + Sync {
    /// Hand a frame to the connection.
    fn send(&self, frame: OutboundFrame);
}

/// Called by a connection each time it (re)opens.
pub trait ReconnectHook: Send + Sync {
    /// Frames to send right after the connection opens.
    fn replay(&self) -> Vec<OutboundFrame>;
}

// =============================================================================
// Active Subscription Registry
// =============================================================================

/// Keys currently subscribed upstream.
///
/// Kept apart from the handler bookkeeping and read only to drive replay,
/// so a reconnect re-sends exactly the set of keys upstream should hold.
#[derive(Debug, Default, Clone)]
pub struct ActiveSubscriptionRegistry {
    keys: BTreeSet<SubscriptionKey>,
}

impl ActiveSubscriptionRegistry {
    /// Record a key as upstream-subscribed. Returns `false` if it already was.
    pub fn mark_active(&mut self, key: SubscriptionKey) -> bool {
        self.keys.insert(key)
    }

    /// Record a key as no longer upstream-subscribed.
    pub fn mark_inactive(&mut self, key: &SubscriptionKey) -> bool {
        self.keys.remove(key)
    }

    /// Whether the key is upstream-subscribed.
    #[must_use]
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.keys.contains(key)
    }

    /// Keys in a stable order.
    #[must_use]
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.keys.iter().cloned().collect()
    }

    /// Number of upstream-subscribed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no key is upstream-subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// =============================================================================
// Subscription Entry
// =============================================================================

/// Handlers registered for one key.
struct SubscriptionEntry {
    /// True iff `handlers` is non-empty.
    upstream_subscribed: bool,
    handlers: Vec<(SubscriberId, EventHandler)>,
}

#[derive(Default)]
struct MultiplexerState {
    entries: HashMap<SubscriptionKey, SubscriptionEntry>,
    subscriber_keys: HashMap<SubscriberId, HashSet<SubscriptionKey>>,
    registry: ActiveSubscriptionRegistry,
}

// =============================================================================
// Subscription Multiplexer
// =============================================================================

/// Shares upstream subscriptions across any number of consumers.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use parking_lot::Mutex;
/// use market_feed_hub::domain::market::{MarketEvent, Resolution, SubscriptionKey};
/// use market_feed_hub::domain::subscription::{OutboundFrame, SubscriptionMultiplexer, UpstreamSink};
///
/// #[derive(Default)]
/// struct Recorder(Mutex<Vec<OutboundFrame>>);
///
/// impl UpstreamSink for Recorder {
///     fn send(&self, frame: OutboundFrame) {
///         self.0.lock().push(frame);
///     }
/// }
///
/// let sink = Arc::new(Recorder::default());
/// let mux = SubscriptionMultiplexer::new(sink.clone());
/// let key = SubscriptionKey::bars("BTC", Resolution::OneMinute);
///
/// // First handler subscribes upstream, second one shares it
/// mux.subscribe(key.clone(), "chart-1".to_string(), Arc::new(|_: &MarketEvent| {}));
/// mux.subscribe(key.clone(), "chart-2".to_string(), Arc::new(|_: &MarketEvent| {}));
/// assert_eq!(sink.0.lock().len(), 1);
///
/// // Only the last unsubscribe reaches upstream
/// mux.unsubscribe("chart-1");
/// mux.unsubscribe("chart-2");
/// assert_eq!(sink.0.lock().last(), Some(&OutboundFrame::Unsubscribe(key)));
/// ```
pub struct SubscriptionMultiplexer {
    state: RwLock<MultiplexerState>,
    sink: Arc<dyn UpstreamSink>,
    handler_panics: AtomicU64,
}

impl SubscriptionMultiplexer {
    /// Create a multiplexer that sends upstream frames through `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn UpstreamSink>) -> Self {
        Self {
            state: RwLock::new(MultiplexerState::default()),
            sink,
            handler_panics: AtomicU64::new(0),
        }
    }

    /// Register `handler` for `key` under `subscriber`.
    ///
    /// Re-subscribing the same subscriber to the same key replaces its
    /// handler. Returns `true` if this was the key's first handler (an
    /// upstream subscribe frame was sent).
    pub fn subscribe(
        &self,
        key: SubscriptionKey,
        subscriber: SubscriberId,
        handler: EventHandler,
    ) -> bool {
        let mut state = self.state.write();

        let entry = state
            .entries
            .entry(key.clone())
            .or_insert_with(|| SubscriptionEntry {
                upstream_subscribed: false,
                handlers: Vec::new(),
            });

        if let Some(slot) = entry.handlers.iter_mut().find(|(id, _)| *id == subscriber) {
            slot.1 = handler;
            return false;
        }

        entry.handlers.push((subscriber.clone(), handler));
        let first = !entry.upstream_subscribed;
        entry.upstream_subscribed = true;

        state
            .subscriber_keys
            .entry(subscriber)
            .or_default()
            .insert(key.clone());

        if first {
            state.registry.mark_active(key.clone());
            tracing::debug!(key = %key, "First subscriber, subscribing upstream");
            self.sink.send(OutboundFrame::Subscribe(key));
        }

        first
    }

    /// Remove every handler registered under `subscriber`.
    ///
    /// Keys left without handlers are unsubscribed upstream and dropped.
    /// Returns the number of handlers removed.
    pub fn unsubscribe(&self, subscriber: &str) -> usize {
        let mut state = self.state.write();

        let Some(keys) = state.subscriber_keys.remove(subscriber) else {
            return 0;
        };

        let mut removed = 0;
        for key in keys {
            let Some(entry) = state.entries.get_mut(&key) else {
                continue;
            };

            let before = entry.handlers.len();
            entry.handlers.retain(|(id, _)| id != subscriber);
            removed += before - entry.handlers.len();

            // Last handler gone - needs upstream unsubscribe
            if entry.handlers.is_empty() {
                state.entries.remove(&key);
                state.registry.mark_inactive(&key);
                tracing::debug!(key = %key, "Last subscriber left, unsubscribing upstream");
                self.sink.send(OutboundFrame::Unsubscribe(key));
            }
        }

        removed
    }

    /// Deliver `event` to every handler registered for `key`.
    ///
    /// A panicking handler is logged and skipped; delivery continues to the
    /// remaining handlers. Returns the number of handlers that completed.
    pub fn dispatch(&self, key: &SubscriptionKey, event: &MarketEvent) -> usize {
        let handlers: Vec<(SubscriberId, EventHandler)> = {
            let state = self.state.read();
            match state.entries.get(key) {
                Some(entry) => entry.handlers.clone(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (subscriber, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    self.handler_panics.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        key = %key,
                        subscriber = %subscriber,
                        "Subscription handler panicked, continuing with remaining handlers"
                    );
                }
            }
        }

        delivered
    }

    /// Whether any handler is registered for `key`.
    #[must_use]
    pub fn has_key(&self, key: &SubscriptionKey) -> bool {
        self.state.read().entries.contains_key(key)
    }

    /// Keys currently subscribed upstream.
    #[must_use]
    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        self.state.read().registry.keys()
    }

    /// Keys held by a subscriber.
    #[must_use]
    pub fn subscriber_keys(&self, subscriber: &str) -> Vec<SubscriptionKey> {
        self.state
            .read()
            .subscriber_keys
            .get(subscriber)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Handler panics caught since creation.
    #[must_use]
    pub fn handler_panics(&self) -> u64 {
        self.handler_panics.load(Ordering::Relaxed)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> MultiplexerStats {
        let state = self.state.read();
        MultiplexerStats {
            key_count: state.entries.len(),
            subscriber_count: state.subscriber_keys.len(),
            handler_count: state.entries.values().map(|e| e.handlers.len()).sum(),
            upstream_count: state.registry.len(),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
        }
    }
}

impl ReconnectHook for SubscriptionMultiplexer {
    fn replay(&self) -> Vec<OutboundFrame> {
        let keys = self.state.read().registry.keys();
        if !keys.is_empty() {
            tracing::info!(count = keys.len(), "Replaying upstream subscriptions");
        }
        keys.into_iter().map(OutboundFrame::Subscribe).collect()
    }
}

/// Multiplexer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiplexerStats {
    /// Keys with at least one handler.
    pub key_count: usize,
    /// Distinct subscribers.
    pub subscriber_count: usize,
    /// Registered handlers across all keys.
    pub handler_count: usize,
    /// Keys subscribed upstream.
    pub upstream_count: usize,
    /// Handler panics caught during dispatch.
    pub handler_panics: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    use super::*;
    use crate::domain::market::{Bar, BarEvent, PriceUpdate, Resolution};

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<OutboundFrame>>,
    }

    impl RecordingSink {
        fn frames(&self) -> Vec<OutboundFrame> {
            self.frames.lock().clone()
        }
    }

    impl UpstreamSink for RecordingSink {
        fn send(&self, frame: OutboundFrame) {
            self.frames.lock().push(frame);
        }
    }

    fn setup() -> (Arc<RecordingSink>, SubscriptionMultiplexer) {
        let sink = Arc::new(RecordingSink::default());
        let mux = SubscriptionMultiplexer::new(sink.clone());
        (sink, mux)
    }

    fn btc_1m() -> SubscriptionKey {
        SubscriptionKey::bars("BTC", Resolution::OneMinute)
    }

    fn noop() -> EventHandler {
        Arc::new(|_: &MarketEvent| {})
    }

    fn counting(counter: &Arc<AtomicUsize>) -> EventHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &MarketEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn bar_event(key: &SubscriptionKey, close: f64) -> MarketEvent {
        MarketEvent::Bar(BarEvent {
            key: key.clone(),
            bar: Bar {
                open_time_ms: 1_700_000_000_000,
                close_time_ms: 0,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close,
                volume: 10.0,
                trades: 0,
            },
        })
    }

    #[test]
    fn first_subscriber_sends_upstream_subscribe() {
        let (sink, mux) = setup();

        assert!(mux.subscribe(btc_1m(), "a".into(), noop()));

        assert_eq!(sink.frames(), vec![OutboundFrame::Subscribe(btc_1m())]);
        assert_eq!(mux.active_keys(), vec![btc_1m()]);
    }

    #[test]
    fn second_subscriber_shares_upstream() {
        let (sink, mux) = setup();

        mux.subscribe(btc_1m(), "a".into(), noop());
        assert!(!mux.subscribe(btc_1m(), "b".into(), noop()));

        assert_eq!(sink.frames().len(), 1);
        assert_eq!(mux.stats().handler_count, 2);
    }

    #[test]
    fn resubscribe_same_subscriber_replaces_handler() {
        let (sink, mux) = setup();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        mux.subscribe(btc_1m(), "a".into(), counting(&first));
        mux.subscribe(btc_1m(), "a".into(), counting(&second));
        mux.dispatch(&btc_1m(), &bar_event(&btc_1m(), 100.5));

        assert_eq!(sink.frames().len(), 1);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_with_remaining_handlers_keeps_upstream() {
        let (sink, mux) = setup();

        mux.subscribe(btc_1m(), "a".into(), noop());
        mux.subscribe(btc_1m(), "b".into(), noop());

        assert_eq!(mux.unsubscribe("a"), 1);
        assert_eq!(sink.frames().len(), 1);
        assert!(mux.has_key(&btc_1m()));
    }

    #[test]
    fn last_unsubscribe_sends_upstream_unsubscribe_and_drops_entry() {
        let (sink, mux) = setup();

        mux.subscribe(btc_1m(), "a".into(), noop());
        mux.unsubscribe("a");

        assert_eq!(
            sink.frames(),
            vec![
                OutboundFrame::Subscribe(btc_1m()),
                OutboundFrame::Unsubscribe(btc_1m()),
            ]
        );
        assert!(!mux.has_key(&btc_1m()));
        assert!(mux.active_keys().is_empty());
    }

    #[test]
    fn unsubscribe_unknown_subscriber_is_noop() {
        let (sink, mux) = setup();

        mux.subscribe(btc_1m(), "a".into(), noop());

        assert_eq!(mux.unsubscribe("nobody"), 0);
        assert_eq!(sink.frames().len(), 1);
        assert_eq!(mux.stats().key_count, 1);
    }

    #[test]
    fn unsubscribe_removes_subscriber_from_every_key() {
        let (sink, mux) = setup();
        let eth_1h = SubscriptionKey::bars("ETH", Resolution::OneHour);

        mux.subscribe(btc_1m(), "a".into(), noop());
        mux.subscribe(eth_1h.clone(), "a".into(), noop());

        assert_eq!(mux.unsubscribe("a"), 2);

        let frames = sink.frames();
        assert_eq!(frames.len(), 4);
        assert!(frames.contains(&OutboundFrame::Unsubscribe(btc_1m())));
        assert!(frames.contains(&OutboundFrame::Unsubscribe(eth_1h)));
    }

    #[test]
    fn same_symbol_different_resolution_are_distinct_keys() {
        let (sink, mux) = setup();

        mux.subscribe(btc_1m(), "a".into(), noop());
        mux.subscribe(
            SubscriptionKey::bars("BTC", Resolution::FiveMinutes),
            "b".into(),
            noop(),
        );
        mux.subscribe(SubscriptionKey::price("BTC"), "c".into(), noop());

        assert_eq!(sink.frames().len(), 3);
        assert_eq!(mux.stats().upstream_count, 3);
    }

    #[test]
    fn dispatch_reaches_every_handler_for_key() {
        let (_sink, mux) = setup();
        let hits = Arc::new(AtomicUsize::new(0));

        mux.subscribe(btc_1m(), "a".into(), counting(&hits));
        mux.subscribe(btc_1m(), "b".into(), counting(&hits));

        assert_eq!(mux.dispatch(&btc_1m(), &bar_event(&btc_1m(), 100.5)), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dispatch_to_unknown_key_delivers_nothing() {
        let (_sink, mux) = setup();
        let event = MarketEvent::Price(PriceUpdate::new("BTC", 1.0));

        assert_eq!(mux.dispatch(&SubscriptionKey::price("BTC"), &event), 0);
    }

    #[test]
    fn panicking_handler_does_not_block_siblings() {
        let (_sink, mux) = setup();
        let hits = Arc::new(AtomicUsize::new(0));

        mux.subscribe(btc_1m(), "a".into(), Arc::new(|_: &MarketEvent| panic!("consumer bug")));
        mux.subscribe(btc_1m(), "b".into(), counting(&hits));

        let delivered = mux.dispatch(&btc_1m(), &bar_event(&btc_1m(), 100.5));

        assert_eq!(delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(mux.stats().handler_panics, 1);
    }

    #[test]
    fn handler_may_unsubscribe_during_dispatch() {
        let sink = Arc::new(RecordingSink::default());
        let mux = Arc::new(SubscriptionMultiplexer::new(sink.clone()));
        let weak = Arc::downgrade(&mux);

        mux.subscribe(
            btc_1m(),
            "a".into(),
            Arc::new(move |_: &MarketEvent| {
                if let Some(mux) = weak.upgrade() {
                    mux.unsubscribe("a");
                }
            }),
        );

        assert_eq!(mux.dispatch(&btc_1m(), &bar_event(&btc_1m(), 1.0)), 1);
        assert!(!mux.has_key(&btc_1m()));
        assert_eq!(sink.frames().len(), 2);
    }

    #[test]
    fn replay_returns_one_subscribe_per_active_key() {
        let (_sink, mux) = setup();
        let keys = [
            btc_1m(),
            SubscriptionKey::bars("ETH", Resolution::OneHour),
            SubscriptionKey::price("SOL"),
        ];

        for (i, key) in keys.iter().enumerate() {
            mux.subscribe(key.clone(), format!("s{i}"), noop());
            mux.subscribe(key.clone(), format!("t{i}"), noop());
        }
        mux.unsubscribe("s0");

        let replay = mux.replay();
        assert_eq!(replay.len(), 3);
        for key in keys {
            assert!(replay.contains(&OutboundFrame::Subscribe(key)));
        }
    }

    #[test]
    fn replay_excludes_keys_dropped_while_disconnected() {
        let (_sink, mux) = setup();

        mux.subscribe(btc_1m(), "a".into(), noop());
        mux.subscribe(SubscriptionKey::price("ETH"), "b".into(), noop());
        mux.unsubscribe("a");

        assert_eq!(
            mux.replay(),
            vec![OutboundFrame::Subscribe(SubscriptionKey::price("ETH"))]
        );
    }

    #[test]
    fn registry_tracks_transitions() {
        let mut registry = ActiveSubscriptionRegistry::default();

        assert!(registry.mark_active(btc_1m()));
        assert!(!registry.mark_active(btc_1m()));
        assert!(registry.contains(&btc_1m()));
        assert!(registry.mark_inactive(&btc_1m()));
        assert!(registry.is_empty());
    }

    #[test]
    fn thread_safety_concurrent_subscriptions() {
        use std::thread;

        let sink = Arc::new(RecordingSink::default());
        let mux = Arc::new(SubscriptionMultiplexer::new(sink.clone()));
        let mut handles = vec![];

        for i in 0..10 {
            let m = Arc::clone(&mux);
            handles.push(thread::spawn(move || {
                m.subscribe(btc_1m(), format!("sub{i}"), Arc::new(|_: &MarketEvent| {}));
                m.subscribe(
                    SubscriptionKey::price(format!("SYM{i}")),
                    format!("sub{i}"),
                    Arc::new(|_: &MarketEvent| {}),
                );
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = mux.stats();
        assert_eq!(stats.subscriber_count, 10);
        // SYM0-SYM9 plus the shared BTC@1m
        assert_eq!(stats.key_count, 11);
        assert_eq!(sink.frames().len(), 11);
    }
}
