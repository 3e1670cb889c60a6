//! Price Aggregation Integration Tests
//!
//! Tests decoding from each wire dialect through the aggregator and the
//! snapshot emitter to a consumer endpoint, plus loading the market
//! directory from disk.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use test_case::test_case;

use market_feed_hub::application::services::SnapshotEmitter;
use market_feed_hub::infrastructure::upstream::protocol_for;
use market_feed_hub::{
    Dialect, FanoutHub, FeedConfig, HubEvent, Namespace, PriceAggregator, PriceUpdate, SeedState,
    SymbolMapping, load_directory,
};

fn feed(dialect: Dialect, symbols: &[(&str, &str, Option<f64>)]) -> FeedConfig {
    FeedConfig {
        namespace: Namespace::new(dialect.as_str()),
        dialect,
        stream_url: "wss://upstream.test".to_string(),
        snapshot_url: None,
        symbols: symbols
            .iter()
            .map(|(native, symbol, scale)| SymbolMapping {
                native: (*native).to_string(),
                symbol: (*symbol).to_string(),
                scale: *scale,
            })
            .collect(),
    }
}

const PYTH_BTC: &str = "e62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43";

// =============================================================================
// Stream to consumer
// =============================================================================

#[test]
fn latest_price_reaches_the_consumer_once_per_change() {
    let aggregator = Arc::new(PriceAggregator::without_seed(Namespace::new("hyperliquid")));
    let hub = Arc::new(FanoutHub::new());
    let mut endpoint = hub.register(16);
    let emitter = SnapshotEmitter::new(
        vec![Arc::clone(&aggregator)],
        Arc::clone(&hub),
        Duration::from_secs(1),
    );
    let codec = protocol_for(&feed(Dialect::Hyperliquid, &[]));

    let first = codec
        .decode(r#"{"channel":"allMids","data":{"mids":{"BTC":"100.5"}}}"#)
        .unwrap();
    aggregator.ingest(first.prices);
    assert_eq!(emitter.emit_dirty(), 1);

    let second = codec
        .decode(r#"{"channel":"allMids","data":{"mids":{"BTC":"102"}}}"#)
        .unwrap();
    aggregator.ingest(second.prices);
    assert_eq!(emitter.emit_dirty(), 1);

    // Nothing changed since the last tick
    assert_eq!(emitter.emit_dirty(), 0);

    let mut seen = Vec::new();
    while let Ok(event) = endpoint.rx.try_recv() {
        let HubEvent::Snapshot { namespace, prices } = event else {
            panic!("unexpected event: {event:?}");
        };
        assert_eq!(namespace.as_str(), "hyperliquid");
        seen.push(prices["BTC"]);
    }
    assert_eq!(seen, vec![100.5, 102.0]);
}

#[test]
fn every_dialect_lands_in_its_own_namespace() {
    let pyth = feed(Dialect::Pyth, &[(PYTH_BTC, "BTC", None)]);
    let indexed = feed(
        Dialect::Indexed,
        &[("0", "BTC", None), ("5", "JPY", Some(0.01))],
    );
    let pyth_agg = PriceAggregator::without_seed(pyth.namespace.clone());
    let indexed_agg = PriceAggregator::without_seed(indexed.namespace.clone());

    let pyth_frame = format!(
        r#"{{"type":"price_update","price_feed":{{"id":"{PYTH_BTC}","price":{{"price":"6400050000000","conf":"1","expo":-8,"publish_time":1700000000}}}}}}"#
    );
    pyth_agg.ingest(protocol_for(&pyth).decode(&pyth_frame).unwrap().prices);
    indexed_agg.ingest(
        protocol_for(&indexed)
            .decode("[0, 63990.5, 5, 15000, 7, 1.0]")
            .unwrap()
            .prices,
    );

    assert_eq!(pyth_agg.price("BTC"), Some(64_000.5));
    assert_eq!(indexed_agg.price("BTC"), Some(63_990.5));
    assert_eq!(indexed_agg.price("JPY"), Some(150.0));
    // Unmapped pair index is dropped
    assert_eq!(indexed_agg.len(), 2);
}

#[test]
fn scaled_ticker_keeps_one_unit_across_mids_and_candles() {
    let config = feed(Dialect::Hyperliquid, &[("kPEPE", "PEPE", Some(0.001))]);
    let codec = protocol_for(&config);
    let aggregator = PriceAggregator::without_seed(config.namespace.clone());

    aggregator.ingest(
        codec
            .decode(r#"{"channel":"allMids","data":{"mids":{"kPEPE":"12"}}}"#)
            .unwrap()
            .prices,
    );
    let from_mids = aggregator.price("PEPE").unwrap();

    let candle = codec
        .decode(r#"{"channel":"candle","data":{"t":1,"T":2,"s":"kPEPE","i":"1m","o":"11","c":"12","h":"12.5","l":"10.5","v":"900","n":3}}"#)
        .unwrap();
    aggregator.ingest(candle.prices);

    assert!((from_mids - 0.012).abs() < 1e-12);
    assert!((aggregator.price("PEPE").unwrap() - from_mids).abs() < 1e-12);
    assert_eq!(aggregator.len(), 1);
    assert!((candle.bars[0].bar.high - 0.0125).abs() < 1e-12);
}

// =============================================================================
// Decode robustness
// =============================================================================

#[test_case(Dialect::Hyperliquid, "" ; "hyperliquid empty")]
#[test_case(Dialect::Hyperliquid, "not json" ; "hyperliquid garbage")]
#[test_case(Dialect::Hyperliquid, r#"{"channel":"allMids"}"# ; "hyperliquid missing data")]
#[test_case(Dialect::Hyperliquid, r#"{"channel":"allMids","data":{"mids":{"BTC":"abc"}}}"# ; "hyperliquid non numeric")]
#[test_case(Dialect::Hyperliquid, r#"{"channel":"pong"}"# ; "hyperliquid pong")]
#[test_case(Dialect::Hyperliquid, r#"{"channel":"candle","data":{"s":"BTC"}}"# ; "hyperliquid truncated candle")]
#[test_case(Dialect::Pyth, "[1,2,3]" ; "pyth array")]
#[test_case(Dialect::Pyth, r#"{"type":"response","status":"success"}"# ; "pyth ack")]
#[test_case(Dialect::Pyth, r#"{"type":"price_update","price_feed":{"id":"ffff","price":{"price":"1","expo":0}}}"# ; "pyth unmapped id")]
#[test_case(Dialect::Pyth, r#"{"type":"price_update","price_feed":{"id":"e62d"}}"# ; "pyth missing price")]
#[test_case(Dialect::Indexed, "{}" ; "indexed object")]
#[test_case(Dialect::Indexed, "[]" ; "indexed empty")]
#[test_case(Dialect::Indexed, r#"["x", "y"]"# ; "indexed strings")]
#[test_case(Dialect::Indexed, "[42, 1.5]" ; "indexed unmapped index")]
fn malformed_or_irrelevant_frames_decode_to_nothing(dialect: Dialect, frame: &str) {
    let config = match dialect {
        Dialect::Hyperliquid => feed(dialect, &[]),
        Dialect::Pyth => feed(dialect, &[(PYTH_BTC, "BTC", None)]),
        Dialect::Indexed => feed(dialect, &[("0", "BTC", None)]),
    };

    assert_eq!(protocol_for(&config).decode(frame), None);
}

// =============================================================================
// Merge properties
// =============================================================================

fn batch() -> impl Strategy<Value = Vec<PriceUpdate>> {
    proptest::collection::vec(
        (prop::sample::select(vec!["BTC", "ETH", "SOL", "JPY"]), 0.01f64..1.0e6)
            .prop_map(|(symbol, price)| PriceUpdate::new(symbol, price)),
        0..12,
    )
}

proptest! {
    /// Ingesting the same batch twice leaves the map unchanged.
    #[test]
    fn merge_is_idempotent(history in proptest::collection::vec(batch(), 0..6), last in batch()) {
        let aggregator = PriceAggregator::without_seed(Namespace::new("n"));
        for b in history {
            aggregator.ingest(b);
        }

        aggregator.ingest(last.clone());
        let once = aggregator.snapshot();
        let changed = aggregator.ingest(last);

        prop_assert_eq!(changed, 0);
        prop_assert_eq!(aggregator.snapshot(), once);
    }

    /// Buffered batches replay over the seed exactly as if they arrived after it.
    #[test]
    fn buffered_batches_win_over_the_seed(seed in batch(), stream in proptest::collection::vec(batch(), 0..6)) {
        let buffered = PriceAggregator::awaiting_seed(Namespace::new("n"));
        let ordered = PriceAggregator::awaiting_seed(Namespace::new("n"));

        for b in &stream {
            buffered.ingest(b.clone());
        }
        buffered.seed(seed.clone());

        ordered.seed(seed);
        for b in stream {
            ordered.ingest(b);
        }

        prop_assert_eq!(buffered.seed_state(), SeedState::Seeded);
        prop_assert_eq!(buffered.snapshot(), ordered.snapshot());
    }
}

// =============================================================================
// Market directory on disk
// =============================================================================

#[test]
fn directory_file_loads_with_env_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
feeds:
  - namespace: hyperliquid
    dialect: hyperliquid
    stream_url: "${{MARKET_FEED_HUB_TEST_UNSET_WS:-wss://api.hyperliquid.xyz/ws}}"
    snapshot_url: "https://api.hyperliquid.xyz/info"
  - namespace: gains
    dialect: indexed
    stream_url: "wss://backend-pricing.eu.gains.trade"
    symbols:
      - {{ native: "0", symbol: BTC }}
"#
    )
    .unwrap();

    let directory = load_directory(file.path()).unwrap();

    assert_eq!(directory.feeds.len(), 2);
    assert_eq!(directory.feeds[0].stream_url, "wss://api.hyperliquid.xyz/ws");
    assert_eq!(
        directory.bar_feed().map(|f| f.namespace.as_str()),
        Some("hyperliquid")
    );
}

#[test]
fn invalid_directory_file_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
feeds:
  - namespace: gains
    dialect: indexed
    stream_url: "https://not-a-websocket"
    symbols:
      - {{ native: "0", symbol: BTC }}
"#
    )
    .unwrap();

    assert!(load_directory(file.path()).is_err());
}

#[test]
fn missing_directory_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();

    assert!(load_directory(&dir.path().join("markets.yaml")).is_err());
}
