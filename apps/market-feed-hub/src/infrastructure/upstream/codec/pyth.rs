//! Pyth dialect.
//!
//! An event stream of parsed price-feed objects. Prices are integer
//! mantissas with a base-10 exponent:
//!
//! ```json
//! {"type":"price_update","price_feed":{"id":"e62d...","price":{"price":"6400050000000","conf":"1","expo":-8,"publish_time":1700000000}}}
//! ```

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Decoded, FeedProtocol, HeartbeatFrame, SymbolDirectory};
use crate::domain::market::{PriceBatch, PriceUpdate, SubscriptionKey};
use crate::infrastructure::config::Dialect;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    price_feed: Option<PriceFeed>,
}

#[derive(Debug, Deserialize)]
struct PriceFeed {
    id: String,
    price: WirePrice,
}

#[derive(Debug, Deserialize)]
struct WirePrice {
    price: Value,
    expo: i32,
}

/// Pyth codec.
#[derive(Debug, Clone)]
pub struct PythProtocol {
    directory: SymbolDirectory,
}

impl PythProtocol {
    /// Create a codec. Unmapped feed ids are dropped.
    #[must_use]
    pub const fn new(directory: SymbolDirectory) -> Self {
        Self { directory }
    }

    /// Configured feed ids, used for bootstrap and snapshot requests.
    #[must_use]
    pub fn feed_ids(&self) -> &[String] {
        self.directory.natives()
    }

    /// Decode the body of a latest-price request (`{"parsed":[...]}`).
    #[must_use]
    pub fn decode_snapshot(&self, body: &Value) -> PriceBatch {
        let Some(feeds) = body.get("parsed").and_then(Value::as_array) else {
            return PriceBatch::new();
        };
        feeds
            .iter()
            .filter_map(|raw| serde_json::from_value::<PriceFeed>(raw.clone()).ok())
            .filter_map(|feed| self.normalize(&feed))
            .collect()
    }

    fn normalize(&self, feed: &PriceFeed) -> Option<PriceUpdate> {
        let raw = scale_mantissa(&feed.price.price, feed.price.expo)?;
        let id = feed.id.as_str();
        self.directory
            .normalize(id, raw)
            .or_else(|| self.directory.normalize(&format!("0x{id}"), raw))
            .or_else(|| {
                id.strip_prefix("0x")
                    .and_then(|bare| self.directory.normalize(bare, raw))
            })
    }
}

/// `mantissa * 10^expo`, computed exactly before converting to `f64`.
fn scale_mantissa(mantissa: &Value, expo: i32) -> Option<f64> {
    let mantissa: i64 = match mantissa {
        Value::String(s) => s.trim().parse().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };

    let value = if expo <= 0 {
        Decimal::try_from_i128_with_scale(i128::from(mantissa), expo.unsigned_abs()).ok()?
    } else {
        let factor = 10_i64.checked_pow(expo.unsigned_abs())?;
        Decimal::from(mantissa).checked_mul(Decimal::from(factor))?
    };

    value.to_f64().filter(|v| v.is_finite())
}

impl FeedProtocol for PythProtocol {
    fn dialect(&self) -> Dialect {
        Dialect::Pyth
    }

    fn decode(&self, text: &str) -> Option<Decoded> {
        let envelope: Envelope = serde_json::from_str(text).ok()?;
        if envelope.kind != "price_update" {
            // subscription "response" acks and anything else
            return None;
        }
        let update = self.normalize(&envelope.price_feed?)?;
        Some(Decoded::prices(vec![update]))
    }

    // Every mapped feed id is already streamed by the bootstrap
    // subscription. Price keys are dispatch-only, so releasing a watch never
    // stops the feed behind the namespace snapshot.
    fn subscribe_frame(&self, _key: &SubscriptionKey) -> Option<String> {
        None
    }

    fn unsubscribe_frame(&self, _key: &SubscriptionKey) -> Option<String> {
        None
    }

    fn heartbeat_frame(&self) -> HeartbeatFrame {
        HeartbeatFrame::Ping
    }

    fn bootstrap_frames(&self) -> Vec<String> {
        if self.feed_ids().is_empty() {
            return Vec::new();
        }
        vec![json!({ "type": "subscribe", "ids": self.feed_ids() }).to_string()]
    }
}
