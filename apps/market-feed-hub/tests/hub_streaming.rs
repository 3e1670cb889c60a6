//! Hub Streaming Integration Tests
//!
//! Drives a `MarketDataService` against an in-memory upstream: the test
//! accepts each connection the hub opens, pushes frames into it, and reads
//! back every frame the hub writes.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use market_feed_hub::{
    ClientHandle, ConnectionPhase, Dialect, FeedConfig, HubEvent, HubSettings, MarketDataService,
    MarketDirectory, Namespace, PriceBatch, PriceSnapshot, PriceUpdate, PriceWatch, Resolution,
    SeedError, SeedState, SnapshotSource, StreamConnector, StreamTransport, SymbolMapping,
};

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// In-memory upstream
// =============================================================================

/// Server side of one accepted connection.
struct Upstream {
    written: fmpsc::UnboundedReceiver<Message>,
    push: fmpsc::UnboundedSender<Result<Message, WsError>>,
}

impl Upstream {
    fn send_text(&self, text: &str) {
        self.push.unbounded_send(Ok(Message::text(text))).unwrap();
    }

    async fn next_text(&mut self) -> String {
        loop {
            let msg = timeout(WAIT, self.written.next())
                .await
                .expect("hub wrote nothing")
                .expect("connection closed");
            if let Message::Text(text) = msg {
                return text.to_string();
            }
        }
    }

    /// Text frames already written, without waiting.
    fn written_so_far(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(Some(msg)) = self.written.next().now_or_never() {
            if let Message::Text(text) = msg {
                frames.push(text.to_string());
            }
        }
        frames
    }
}

/// Connector that hands every accepted connection to the test.
struct InMemoryConnector {
    accepting: AtomicBool,
    attempts: AtomicU32,
    accepted: mpsc::UnboundedSender<Upstream>,
}

impl InMemoryConnector {
    fn new(accepting: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Upstream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accepting: AtomicBool::new(accepting),
            attempts: AtomicU32::new(0),
            accepted: tx,
        });
        (connector, rx)
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamConnector for InMemoryConnector {
    async fn connect(&self, _url: &str) -> Result<StreamTransport, WsError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(WsError::ConnectionClosed);
        }

        let (write_tx, write_rx) = fmpsc::unbounded::<Message>();
        let (push_tx, push_rx) = fmpsc::unbounded::<Result<Message, WsError>>();
        let _ = self.accepted.send(Upstream {
            written: write_rx,
            push: push_tx,
        });
        Ok(StreamTransport {
            sink: Box::pin(write_tx.sink_map_err(|_| WsError::ConnectionClosed)),
            stream: Box::pin(push_rx),
        })
    }
}

/// Snapshot source that answers once released.
struct GatedSnapshot {
    gate: Notify,
    batch: PriceBatch,
}

#[async_trait]
impl SnapshotSource for GatedSnapshot {
    async fn fetch(&self, _namespace: &Namespace) -> Result<PriceBatch, SeedError> {
        self.gate.notified().await;
        Ok(self.batch.clone())
    }
}

/// Snapshot source for directories without snapshot endpoints.
struct NoSnapshots;

#[async_trait]
impl SnapshotSource for NoSnapshots {
    async fn fetch(&self, namespace: &Namespace) -> Result<PriceBatch, SeedError> {
        Err(SeedError::NotConfigured(namespace.clone()))
    }
}

// =============================================================================
// Setup
// =============================================================================

fn hyperliquid() -> Namespace {
    Namespace::new("hyperliquid")
}

fn directory(snapshot_url: Option<&str>) -> MarketDirectory {
    MarketDirectory {
        feeds: vec![FeedConfig {
            namespace: hyperliquid(),
            dialect: Dialect::Hyperliquid,
            stream_url: "wss://upstream.test/ws".to_string(),
            snapshot_url: snapshot_url.map(str::to_string),
            symbols: Vec::new(),
        }],
        bar_source: Some(hyperliquid()),
    }
}

fn settings(max_reconnect_attempts: u32) -> HubSettings {
    let mut settings = HubSettings::default();
    settings.websocket.reconnect_delay_initial = Duration::from_millis(20);
    settings.websocket.reconnect_delay_max = Duration::from_millis(20);
    settings.websocket.max_reconnect_attempts = max_reconnect_attempts;
    settings.fanout.emit_interval = Duration::from_millis(50);
    settings
}

fn mids(prices: &[(&str, &str)]) -> String {
    let mids: serde_json::Map<String, serde_json::Value> = prices
        .iter()
        .map(|(coin, px)| ((*coin).to_string(), serde_json::Value::from(*px)))
        .collect();
    serde_json::json!({ "channel": "allMids", "data": { "mids": mids } }).to_string()
}

fn candle(coin: &str, close: &str) -> String {
    serde_json::json!({
        "channel": "candle",
        "data": {
            "t": 1_700_000_000_000_i64, "T": 1_700_000_059_999_i64, "s": coin, "i": "1m",
            "o": "100", "h": "103", "l": "99", "c": close, "v": "12.5", "n": 42
        }
    })
    .to_string()
}

async fn wait_for_status(
    client: &mut ClientHandle,
    accept: impl Fn(ConnectionPhase, bool) -> bool,
) {
    timeout(WAIT, async {
        loop {
            if let Some(HubEvent::FeedStatus { status, .. }) = client.next_event().await
                && accept(status.phase, status.terminal)
            {
                return;
            }
        }
    })
    .await
    .expect("status never reached");
}

async fn next_snapshot(client: &mut ClientHandle) -> Arc<PriceSnapshot> {
    timeout(WAIT, async {
        loop {
            if let Some(HubEvent::Snapshot { prices, .. }) = client.next_event().await {
                return prices;
            }
        }
    })
    .await
    .expect("no snapshot emitted")
}

async fn open_hub(
    settings: HubSettings,
    directory: MarketDirectory,
    snapshots: Arc<dyn SnapshotSource>,
) -> (
    MarketDataService,
    ClientHandle,
    Upstream,
    mpsc::UnboundedReceiver<Upstream>,
    Arc<InMemoryConnector>,
) {
    let (connector, mut accepted) = InMemoryConnector::new(true);
    let service = MarketDataService::new(settings, directory, connector.clone(), snapshots);
    let mut client = service.attach();

    let mut upstream = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
    wait_for_status(&mut client, |phase, _| phase == ConnectionPhase::Open).await;
    assert!(upstream.next_text().await.contains("allMids"));

    (service, client, upstream, accepted, connector)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn snapshots_follow_the_stream_and_quiet_ticks_emit_nothing() {
    let (_service, mut client, upstream, _accepted, _connector) =
        open_hub(settings(3), directory(None), Arc::new(NoSnapshots)).await;

    upstream.send_text(&mids(&[("BTC", "100.5")]));
    let first = next_snapshot(&mut client).await;
    assert_eq!(first.get("BTC"), Some(&100.5));

    upstream.send_text(&mids(&[("BTC", "102")]));
    let second = next_snapshot(&mut client).await;
    assert_eq!(second.get("BTC"), Some(&102.0));
    assert_eq!(client.get_price(&hyperliquid(), "BTC"), Some(102.0));

    // Re-sending the same price changes nothing
    upstream.send_text(&mids(&[("BTC", "102")]));
    let quiet = timeout(Duration::from_millis(200), next_snapshot(&mut client)).await;
    assert!(quiet.is_err());
}

#[tokio::test]
async fn shared_bar_subscription_is_replayed_once_after_reconnect() {
    let (_service, client, mut upstream, mut accepted, _connector) =
        open_hub(settings(3), directory(None), Arc::new(NoSnapshots)).await;

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let sub_a = client
        .subscribe_bars("BTC", Resolution::OneMinute, move |bar| {
            let _ = tx_a.send(bar.bar.close);
        })
        .unwrap();
    let sub_b = client
        .subscribe_bars("BTC", Resolution::OneMinute, move |bar| {
            let _ = tx_b.send(bar.bar.close);
        })
        .unwrap();

    let subscribe = upstream.next_text().await;
    assert!(subscribe.contains("\"subscribe\"") && subscribe.contains("candle"));

    upstream.send_text(&candle("BTC", "101.5"));
    assert_eq!(timeout(WAIT, rx_a.recv()).await.unwrap(), Some(101.5));
    assert_eq!(timeout(WAIT, rx_b.recv()).await.unwrap(), Some(101.5));

    // Upstream goes away; the hub reconnects and restores the one key
    drop(upstream);
    let mut upstream = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
    assert!(upstream.next_text().await.contains("allMids"));
    let replayed = upstream.next_text().await;
    assert!(replayed.contains("\"subscribe\"") && replayed.contains("\"BTC\""));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(upstream.written_so_far().is_empty());

    // Only the last handler leaving reaches upstream
    assert_eq!(sub_a.cancel(), 1);
    assert_eq!(sub_b.cancel(), 1);
    let unsubscribe = upstream.next_text().await;
    assert!(unsubscribe.contains("\"unsubscribe\"") && unsubscribe.contains("\"BTC\""));
}

#[tokio::test]
async fn panicking_price_handler_does_not_starve_others() {
    let (_service, client, mut upstream, _accepted, _connector) =
        open_hub(settings(3), directory(None), Arc::new(NoSnapshots)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _bad = client
        .watch_price(&hyperliquid(), "BTC", |_| panic!("consumer bug"))
        .unwrap();
    let _good = client
        .watch_price(&hyperliquid(), "BTC", move |update| {
            let _ = tx.send(update.clone());
        })
        .unwrap();

    upstream.send_text(&mids(&[("BTC", "100.5"), ("ETH", "3000")]));

    let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, PriceUpdate::new("BTC", 100.5));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    // Price keys never reach the hyperliquid wire
    assert!(upstream.written_so_far().is_empty());
}

#[tokio::test]
async fn retry_ceiling_reports_unavailable_until_restarted() {
    let (connector, mut accepted) = InMemoryConnector::new(false);
    let service = MarketDataService::new(
        settings(2),
        directory(None),
        connector.clone(),
        Arc::new(NoSnapshots),
    );
    let mut client = service.attach();

    wait_for_status(&mut client, |_, terminal| terminal).await;
    assert_eq!(connector.attempts(), 3);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.attempts(), 3);
    let status = client.feed_status(&hyperliquid()).unwrap();
    assert!(status.terminal);
    assert_eq!(status.phase, ConnectionPhase::Disconnected);

    connector.accepting.store(true, Ordering::SeqCst);
    client.restart_feed(&hyperliquid()).unwrap();
    wait_for_status(&mut client, |phase, _| phase == ConnectionPhase::Open).await;
    assert!(timeout(WAIT, accepted.recv()).await.unwrap().is_some());
    assert!(!client.feed_status(&hyperliquid()).unwrap().terminal);
}

#[tokio::test]
async fn stream_updates_buffered_before_seed_win_over_it() {
    let snapshots = Arc::new(GatedSnapshot {
        gate: Notify::new(),
        batch: vec![PriceUpdate::new("BTC", 99.0), PriceUpdate::new("ETH", 10.0)],
    });
    let (service, client, upstream, _accepted, _connector) = open_hub(
        settings(3),
        directory(Some("https://upstream.test/info")),
        snapshots.clone(),
    )
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watch = client
        .watch_price(&hyperliquid(), "BTC", move |update| {
            let _ = tx.send(update.price);
        })
        .unwrap();
    upstream.send_text(&mids(&[("BTC", "101")]));
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(101.0));

    // Buffered, not applied
    assert_eq!(client.get_price(&hyperliquid(), "BTC"), None);

    snapshots.gate.notify_one();
    timeout(WAIT, async {
        while client.get_price(&hyperliquid(), "ETH").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(client.get_price(&hyperliquid(), "BTC"), Some(101.0));
    assert_eq!(client.get_price(&hyperliquid(), "ETH"), Some(10.0));
    let summary = &service.feed_summaries()[0];
    assert_eq!(summary.seed, Some(SeedState::Seeded));
}

#[tokio::test]
async fn last_client_detaching_closes_the_upstream() {
    let (service, client, mut upstream, _accepted, _connector) =
        open_hub(settings(3), directory(None), Arc::new(NoSnapshots)).await;
    let second = service.attach();
    assert_eq!(service.client_count(), 2);

    drop(client);
    assert!(service.is_running());

    drop(second);
    assert!(!service.is_running());
    assert_eq!(service.client_count(), 0);

    // Drain until the actor closes its end
    timeout(WAIT, async { while upstream.written.next().await.is_some() {} })
        .await
        .expect("upstream still open");
}

#[tokio::test]
async fn unknown_namespace_is_rejected() {
    let (_service, client, _upstream, _accepted, _connector) =
        open_hub(settings(3), directory(None), Arc::new(NoSnapshots)).await;

    let result = client.watch_price(&Namespace::new("nope"), "BTC", |_| {});

    assert!(result.is_err());
    assert!(client.get_snapshot(&Namespace::new("nope")).is_empty());
}

#[tokio::test]
async fn event_stream_carries_snapshots_once_taken() {
    let (_service, mut client, upstream, _accepted, _connector) =
        open_hub(settings(3), directory(None), Arc::new(NoSnapshots)).await;
    assert!(
        client
            .feed_status(&hyperliquid())
            .is_some_and(|status| status.is_active())
    );

    let mut events = client.take_event_stream().unwrap();
    assert!(client.take_event_stream().is_none());
    assert_eq!(client.next_event().await, None);

    upstream.send_text(&mids(&[("ETH", "3100.25")]));
    let prices = timeout(WAIT, async {
        loop {
            if let Some(HubEvent::Snapshot { prices, .. }) = events.next().await {
                return prices;
            }
        }
    })
    .await
    .expect("no snapshot on the stream");

    assert_eq!(prices.get("ETH"), Some(&3100.25));
}

#[tokio::test]
async fn cancelling_a_pyth_watch_keeps_the_bootstrapped_feed() {
    let pyth = Namespace::new("pyth");
    let directory = MarketDirectory {
        feeds: vec![FeedConfig {
            namespace: pyth.clone(),
            dialect: Dialect::Pyth,
            stream_url: "wss://upstream.test/ws".to_string(),
            snapshot_url: None,
            symbols: vec![SymbolMapping {
                native: "aa".to_string(),
                symbol: "BTC".to_string(),
                scale: None,
            }],
        }],
        bar_source: None,
    };
    let pyth_update = |mantissa: &str| {
        serde_json::json!({
            "type": "price_update",
            "price_feed": {"id": "aa", "price": {"price": mantissa, "expo": -2}}
        })
        .to_string()
    };

    let (connector, mut accepted) = InMemoryConnector::new(true);
    let service =
        MarketDataService::new(settings(3), directory, connector, Arc::new(NoSnapshots));
    let mut client = service.attach();
    let mut upstream = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
    wait_for_status(&mut client, |phase, _| phase == ConnectionPhase::Open).await;
    let bootstrap: serde_json::Value = serde_json::from_str(&upstream.next_text().await).unwrap();
    assert_eq!(bootstrap, serde_json::json!({"type": "subscribe", "ids": ["aa"]}));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let watch: PriceWatch = client
        .watch_price(&pyth, "BTC", move |update| {
            let _ = tx.send(update.clone());
        })
        .unwrap();
    upstream.send_text(&pyth_update("6400050"));
    let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, PriceUpdate::new("BTC", 64_000.5));

    assert_eq!(watch.cancel(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The bootstrap subscription already covers the id
    assert!(upstream.written_so_far().is_empty());

    upstream.send_text(&pyth_update("6500000"));
    timeout(WAIT, async {
        while client.get_price(&pyth, "BTC") != Some(65_000.0) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pyth snapshot went stale");
}
