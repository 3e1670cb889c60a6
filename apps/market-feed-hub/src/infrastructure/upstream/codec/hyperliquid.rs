//! Hyperliquid dialect.
//!
//! Prices arrive as an object-keyed mids dictionary on the `allMids`
//! channel; bars arrive on the `candle` channel with every numeric field
//! encoded as a string.
//!
//! ```json
//! {"channel":"allMids","data":{"mids":{"BTC":"64000.5","ETH":"3120.1"}}}
//! {"channel":"candle","data":{"t":1700000000000,"T":1700000059999,"s":"BTC","i":"1m",
//!   "o":"100","c":"100.5","h":"101","l":"99","v":"10","n":42}}
//! ```

use serde::Deserialize;
use serde_json::{Value, json};

use super::{Decoded, FeedProtocol, HeartbeatFrame, SymbolDirectory, parse_number};
use crate::domain::market::{Bar, BarEvent, PriceBatch, PriceUpdate, SubscriptionKey};
use crate::infrastructure::config::Dialect;

#[derive(Debug, Deserialize)]
struct Envelope {
    channel: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct WireCandle {
    t: i64,
    #[serde(rename = "T", default)]
    close_time: i64,
    s: String,
    #[serde(default)]
    i: Option<String>,
    o: Value,
    h: Value,
    l: Value,
    c: Value,
    #[serde(default)]
    v: Value,
    #[serde(default)]
    n: u64,
}

/// Hyperliquid codec.
#[derive(Debug, Clone)]
pub struct HyperliquidProtocol {
    directory: SymbolDirectory,
}

impl HyperliquidProtocol {
    /// Create a codec. Unmapped coins pass through as their own symbol.
    #[must_use]
    pub const fn new(directory: SymbolDirectory) -> Self {
        Self { directory }
    }

    /// Decode the body of an `allMids` info request.
    #[must_use]
    pub fn decode_snapshot(&self, body: &Value) -> PriceBatch {
        self.decode_mids(body)
    }

    fn decode_mids(&self, mids: &Value) -> PriceBatch {
        let Some(map) = mids.as_object() else {
            return PriceBatch::new();
        };
        map.iter()
            .filter_map(|(coin, raw)| {
                let price = parse_number(raw)?;
                self.directory.normalize_or_passthrough(coin, price)
            })
            .collect()
    }

    fn decode_candles(&self, data: Value) -> Decoded {
        let candles: Vec<Value> = match data {
            Value::Array(items) => items,
            other @ Value::Object(_) => vec![other],
            _ => return Decoded::default(),
        };

        let mut decoded = Decoded::default();
        for raw in candles {
            let Ok(candle) = serde_json::from_value::<WireCandle>(raw) else {
                continue;
            };
            let (symbol, scale) = self.directory.resolve_or_passthrough(&candle.s);
            let Some(bar) = to_bar(&candle, scale) else {
                continue;
            };
            let symbol = symbol.to_string();

            decoded.prices.push(PriceUpdate::new(symbol.clone(), bar.close));
            if let Some(resolution) = candle.i.as_deref().and_then(|i| i.parse().ok()) {
                decoded.bars.push(BarEvent {
                    key: SubscriptionKey::bars(symbol, resolution),
                    bar,
                });
            }
        }
        decoded
    }

    fn candle_frame(&self, method: &str, key: &SubscriptionKey) -> Option<String> {
        let resolution = key.resolution?;
        let coin = self.directory.native_or_passthrough(&key.symbol);
        Some(
            json!({
                "method": method,
                "subscription": {
                    "type": "candle",
                    "coin": coin,
                    "interval": resolution.as_str(),
                }
            })
            .to_string(),
        )
    }
}

/// Build a bar with prices multiplied by `scale`; volume stays in the
/// native unit.
fn to_bar(candle: &WireCandle, scale: f64) -> Option<Bar> {
    let price = |raw: &Value| parse_number(raw).map(|p| p * scale).filter(|p| p.is_finite());
    Some(Bar {
        open_time_ms: candle.t,
        close_time_ms: candle.close_time,
        open: price(&candle.o)?,
        high: price(&candle.h)?,
        low: price(&candle.l)?,
        close: price(&candle.c)?,
        volume: parse_number(&candle.v).unwrap_or(0.0),
        trades: candle.n,
    })
}

impl FeedProtocol for HyperliquidProtocol {
    fn dialect(&self) -> Dialect {
        Dialect::Hyperliquid
    }

    fn decode(&self, text: &str) -> Option<Decoded> {
        let envelope: Envelope = serde_json::from_str(text).ok()?;
        match envelope.channel.as_str() {
            "allMids" => {
                let mids = envelope.data.get("mids")?;
                Decoded::prices(self.decode_mids(mids)).non_empty()
            }
            "candle" => self.decode_candles(envelope.data).non_empty(),
            // pong, subscriptionResponse, error and anything else
            _ => None,
        }
    }

    fn subscribe_frame(&self, key: &SubscriptionKey) -> Option<String> {
        self.candle_frame("subscribe", key)
    }

    fn unsubscribe_frame(&self, key: &SubscriptionKey) -> Option<String> {
        self.candle_frame("unsubscribe", key)
    }

    fn heartbeat_frame(&self) -> HeartbeatFrame {
        HeartbeatFrame::Text(json!({ "method": "ping" }).to_string())
    }

    fn bootstrap_frames(&self) -> Vec<String> {
        vec![
            json!({
                "method": "subscribe",
                "subscription": { "type": "allMids" }
            })
            .to_string(),
        ]
    }

    fn is_heartbeat_ack(&self, text: &str) -> bool {
        serde_json::from_str::<Envelope>(text).is_ok_and(|e| e.channel == "pong")
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::domain::market::Resolution;
    use crate::infrastructure::config::SymbolMapping;

    fn codec() -> HyperliquidProtocol {
        HyperliquidProtocol::new(SymbolDirectory::new(&[SymbolMapping {
            native: "kPEPE".to_string(),
            symbol: "PEPE".to_string(),
            scale: Some(0.001),
        }]))
    }

    fn price_of(decoded: &Decoded, symbol: &str) -> Option<f64> {
        decoded
            .prices
            .iter()
            .find(|p| p.symbol == symbol)
            .map(|p| p.price)
    }

    #[test]
    fn decodes_all_mids() {
        let frame = r#"{"channel":"allMids","data":{"mids":{"BTC":"64000.5","ETH":"3120.1","kPEPE":"12"}}}"#;

        let decoded = codec().decode(frame).unwrap();

        assert_eq!(decoded.prices.len(), 3);
        assert_eq!(price_of(&decoded, "BTC"), Some(64000.5));
        assert!((price_of(&decoded, "PEPE").unwrap() - 0.012).abs() < 1e-12);
        assert!(decoded.bars.is_empty());
    }

    #[test]
    fn skips_unparseable_mids() {
        let frame = r#"{"channel":"allMids","data":{"mids":{"BTC":"oops","ETH":"3120.1"}}}"#;

        let decoded = codec().decode(frame).unwrap();

        assert_eq!(decoded.prices, vec![PriceUpdate::new("ETH", 3120.1)]);
    }

    #[test]
    fn decodes_candle_into_bar_and_price() {
        let frame = r#"{"channel":"candle","data":{"t":1700000000000,"T":1700000059999,"s":"BTC","i":"1m","o":"100","c":"100.5","h":"101","l":"99","v":"10","n":42}}"#;

        let decoded = codec().decode(frame).unwrap();

        assert_eq!(decoded.prices, vec![PriceUpdate::new("BTC", 100.5)]);
        assert_eq!(decoded.bars.len(), 1);
        let event = &decoded.bars[0];
        assert_eq!(event.key, SubscriptionKey::bars("BTC", Resolution::OneMinute));
        assert_eq!(event.bar.open_time_ms, 1_700_000_000_000);
        assert_eq!(event.bar.close_time_ms, 1_700_000_059_999);
        assert_eq!(event.bar.high, 101.0);
        assert_eq!(event.bar.trades, 42);
    }

    #[test]
    fn scaled_ticker_candle_uses_the_mids_unit() {
        let mids = codec()
            .decode(r#"{"channel":"allMids","data":{"mids":{"kPEPE":"12"}}}"#)
            .unwrap();
        let candle = codec()
            .decode(r#"{"channel":"candle","data":{"t":1,"T":2,"s":"kPEPE","i":"1m","o":"10","c":"12","h":"13","l":"9","v":"5000","n":7}}"#)
            .unwrap();

        let from_mids = price_of(&mids, "PEPE").unwrap();
        let from_candle = price_of(&candle, "PEPE").unwrap();
        assert!((from_mids - from_candle).abs() < 1e-12);
        assert!((from_candle - 0.012).abs() < 1e-12);

        let event = &candle.bars[0];
        assert_eq!(event.key, SubscriptionKey::bars("PEPE", Resolution::OneMinute));
        assert!((event.bar.open - 0.010).abs() < 1e-12);
        assert!((event.bar.high - 0.013).abs() < 1e-12);
        assert!((event.bar.low - 0.009).abs() < 1e-12);
        assert!((event.bar.close - 0.012).abs() < 1e-12);
        assert_eq!(event.bar.volume, 5000.0);
    }

    #[test]
    fn decodes_candle_array() {
        let frame = r#"{"channel":"candle","data":[
            {"t":1,"s":"BTC","i":"1m","o":"1","c":"2","h":"2","l":"1","v":"0"},
            {"t":2,"s":"ETH","i":"1h","o":"1","c":"3","h":"3","l":"1","v":"0"}
        ]}"#;

        let decoded = codec().decode(frame).unwrap();

        assert_eq!(decoded.bars.len(), 2);
        assert_eq!(decoded.prices.len(), 2);
    }

    #[test]
    fn candle_without_interval_yields_price_only() {
        let frame = r#"{"channel":"candle","data":{"t":1,"s":"BTC","o":"1","c":"2","h":"2","l":"1","v":"0"}}"#;

        let decoded = codec().decode(frame).unwrap();

        assert!(decoded.bars.is_empty());
        assert_eq!(decoded.prices, vec![PriceUpdate::new("BTC", 2.0)]);
    }

    #[test_case(r#"{"channel":"pong"}"# ; "pong")]
    #[test_case(r#"{"channel":"subscriptionResponse","data":{"method":"subscribe"}}"# ; "subscription response")]
    #[test_case(r#"{"channel":"error","data":"Invalid subscription"}"# ; "error channel")]
    #[test_case(r#"{"channel":"allMids","data":{}}"# ; "mids missing")]
    #[test_case(r#"{"channel":"candle","data":{"t":"bad"}}"# ; "malformed candle")]
    #[test_case("not json" ; "garbage")]
    #[test_case("" ; "empty")]
    #[test_case("[1,2,3]" ; "array")]
    fn ignores_non_price_frames(frame: &str) {
        assert!(codec().decode(frame).is_none());
    }

    #[test]
    fn candle_subscribe_frame_matches_wire_schema() {
        let key = SubscriptionKey::bars("PEPE", Resolution::FifteenMinutes);

        let frame: Value = serde_json::from_str(&codec().subscribe_frame(&key).unwrap()).unwrap();

        assert_eq!(
            frame,
            json!({
                "method": "subscribe",
                "subscription": {"type": "candle", "coin": "kPEPE", "interval": "15m"}
            })
        );
    }

    #[test]
    fn unsubscribe_frame_uses_unsubscribe_method() {
        let key = SubscriptionKey::bars("BTC", Resolution::OneDay);

        let frame: Value =
            serde_json::from_str(&codec().unsubscribe_frame(&key).unwrap()).unwrap();

        assert_eq!(frame["method"], "unsubscribe");
        assert_eq!(frame["subscription"]["interval"], "1d");
    }

    #[test]
    fn price_keys_need_no_frame() {
        assert!(codec().subscribe_frame(&SubscriptionKey::price("BTC")).is_none());
    }

    #[test]
    fn bootstrap_subscribes_all_mids() {
        let frames = codec().bootstrap_frames();
        let frame: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["subscription"]["type"], "allMids");
    }

    #[test]
    fn recognizes_pong() {
        assert!(codec().is_heartbeat_ack(r#"{"channel":"pong"}"#));
        assert!(!codec().is_heartbeat_ack(r#"{"channel":"allMids","data":{}}"#));
    }

    #[test]
    fn decodes_snapshot_body() {
        let body = json!({"BTC": "64000.5", "ETH": "3120.1", "bad": null});

        let batch = codec().decode_snapshot(&body);

        assert_eq!(batch.len(), 2);
    }
}
