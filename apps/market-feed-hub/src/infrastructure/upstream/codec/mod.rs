//! Wire Codecs
//!
//! One [`FeedProtocol`] per upstream dialect. A codec turns raw text frames
//! into canonical prices and bars, and turns dialect-neutral
//! [`OutboundFrame`]s into the exact frames the upstream expects.
//!
//! # Failure Model
//!
//! Decoding is total: malformed JSON, unknown channels, unmapped
//! identifiers and unparseable numbers all yield `None` (or are skipped
//! inside an otherwise valid frame). A wire hiccup must never reach the
//! connection state machine.

pub mod hyperliquid;
pub mod indexed;
pub mod pyth;
mod symbols;

use std::sync::Arc;

use tokio_tungstenite::tungstenite::Message;

pub use hyperliquid::HyperliquidProtocol;
pub use indexed::IndexedProtocol;
pub use pyth::PythProtocol;
pub use symbols::SymbolDirectory;

use crate::domain::market::{BarEvent, PriceBatch, SubscriptionKey};
use crate::domain::subscription::OutboundFrame;
use crate::infrastructure::config::{Dialect, FeedConfig};

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    /// Price updates in frame order, already mapped and scaled.
    pub prices: PriceBatch,
    /// Bar updates in frame order.
    pub bars: Vec<BarEvent>,
}

impl Decoded {
    /// Decoded result carrying prices only.
    #[must_use]
    pub const fn prices(prices: PriceBatch) -> Self {
        Self {
            prices,
            bars: Vec::new(),
        }
    }

    /// Whether nothing was decoded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty() && self.bars.is_empty()
    }

    /// `None` when nothing was decoded.
    #[must_use]
    pub fn non_empty(self) -> Option<Self> {
        if self.is_empty() { None } else { Some(self) }
    }
}

/// How a dialect keeps the connection alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatFrame {
    /// Application-level text frame.
    Text(String),
    /// Transport-level websocket ping.
    Ping,
}

/// Upstream wire dialect.
pub trait FeedProtocol: Send + Sync {
    /// Dialect implemented.
    fn dialect(&self) -> Dialect;

    /// Decode one text frame. Never panics.
    fn decode(&self, text: &str) -> Option<Decoded>;

    /// Frame that starts streaming `key`, if the dialect can express it.
    fn subscribe_frame(&self, key: &SubscriptionKey) -> Option<String>;

    /// Frame that stops streaming `key`, if the dialect can express it.
    fn unsubscribe_frame(&self, key: &SubscriptionKey) -> Option<String>;

    /// Keepalive frame.
    fn heartbeat_frame(&self) -> HeartbeatFrame;

    /// Frames sent on every open, before replayed subscriptions.
    fn bootstrap_frames(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether `text` acknowledges a heartbeat.
    fn is_heartbeat_ack(&self, _text: &str) -> bool {
        false
    }

    /// Encode a dialect-neutral frame into a websocket message.
    fn encode(&self, frame: &OutboundFrame) -> Option<Message> {
        match frame {
            OutboundFrame::Subscribe(key) => self.subscribe_frame(key).map(Message::text),
            OutboundFrame::Unsubscribe(key) => self.unsubscribe_frame(key).map(Message::text),
            OutboundFrame::Heartbeat => Some(match self.heartbeat_frame() {
                HeartbeatFrame::Text(text) => Message::text(text),
                HeartbeatFrame::Ping => Message::Ping(Default::default()),
            }),
        }
    }
}

/// Build the codec for a configured feed.
#[must_use]
pub fn protocol_for(feed: &FeedConfig) -> Arc<dyn FeedProtocol> {
    let directory = SymbolDirectory::new(&feed.symbols);
    match feed.dialect {
        Dialect::Hyperliquid => Arc::new(HyperliquidProtocol::new(directory)),
        Dialect::Pyth => Arc::new(PythProtocol::new(directory)),
        Dialect::Indexed => Arc::new(IndexedProtocol::new(directory)),
    }
}

/// Parse a JSON number or numeric string as `f64`.
pub(crate) fn parse_number(value: &serde_json::Value) -> Option<f64> {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;
    use crate::domain::market::Namespace;

    #[test_case(json!(1.5), Some(1.5) ; "number")]
    #[test_case(json!("64000.5"), Some(64000.5) ; "numeric string")]
    #[test_case(json!(" 2 "), Some(2.0) ; "padded string")]
    #[test_case(json!("abc"), None ; "garbage string")]
    #[test_case(json!("NaN"), None ; "nan string")]
    #[test_case(json!(null), None ; "null")]
    #[test_case(json!([1]), None ; "array")]
    fn parses_numbers(value: serde_json::Value, expected: Option<f64>) {
        assert_eq!(parse_number(&value), expected);
    }

    #[test]
    fn decoded_non_empty() {
        assert!(Decoded::default().non_empty().is_none());
        let decoded = Decoded::prices(vec![crate::domain::market::PriceUpdate::new("BTC", 1.0)]);
        assert!(decoded.non_empty().is_some());
    }

    #[test]
    fn protocol_for_matches_dialect() {
        for dialect in [Dialect::Hyperliquid, Dialect::Pyth, Dialect::Indexed] {
            let feed = FeedConfig {
                namespace: Namespace::new("x"),
                dialect,
                stream_url: "wss://x".to_string(),
                snapshot_url: None,
                symbols: Vec::new(),
            };
            assert_eq!(protocol_for(&feed).dialect(), dialect);
        }
    }

    #[test]
    fn heartbeat_encodes_per_dialect() {
        let hl = HyperliquidProtocol::new(SymbolDirectory::default());
        let gains = IndexedProtocol::new(SymbolDirectory::default());

        assert_eq!(
            hl.encode(&OutboundFrame::Heartbeat),
            Some(Message::text(r#"{"method":"ping"}"#.to_string()))
        );
        assert!(matches!(
            gains.encode(&OutboundFrame::Heartbeat),
            Some(Message::Ping(_))
        ));
    }
}
