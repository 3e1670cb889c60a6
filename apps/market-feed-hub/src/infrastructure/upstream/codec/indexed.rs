//! Indexed dialect.
//!
//! The stream pushes flat `[index, price, index, price, ...]` arrays for
//! every pair; there is no subscribe protocol. Pair indices map to symbols
//! through the directory, which also carries per-pair scale factors.

use serde_json::Value;

use super::{Decoded, FeedProtocol, HeartbeatFrame, SymbolDirectory, parse_number};
use crate::domain::market::{PriceBatch, SubscriptionKey};
use crate::infrastructure::config::Dialect;

/// Index/price pair codec.
#[derive(Debug, Clone)]
pub struct IndexedProtocol {
    directory: SymbolDirectory,
}

impl IndexedProtocol {
    /// Create a codec. Unmapped indices are dropped.
    #[must_use]
    pub const fn new(directory: SymbolDirectory) -> Self {
        Self { directory }
    }

    /// Decode the body of a charts request (`{"closes":[p0, p1, ...]}`).
    #[must_use]
    pub fn decode_snapshot(&self, body: &Value) -> PriceBatch {
        let Some(closes) = body.get("closes").and_then(Value::as_array) else {
            return PriceBatch::new();
        };
        closes
            .iter()
            .enumerate()
            .filter_map(|(index, raw)| {
                let price = parse_number(raw)?;
                self.directory.normalize(&index.to_string(), price)
            })
            .collect()
    }
}

fn parse_index(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl FeedProtocol for IndexedProtocol {
    fn dialect(&self) -> Dialect {
        Dialect::Indexed
    }

    fn decode(&self, text: &str) -> Option<Decoded> {
        let Value::Array(items) = serde_json::from_str::<Value>(text).ok()? else {
            return None;
        };

        // chunks_exact drops an odd trailing element
        let prices: PriceBatch = items
            .chunks_exact(2)
            .filter_map(|pair| {
                let index = parse_index(&pair[0])?;
                let price = parse_number(&pair[1])?;
                self.directory.normalize(&index.to_string(), price)
            })
            .collect();

        Decoded::prices(prices).non_empty()
    }

    fn subscribe_frame(&self, _key: &SubscriptionKey) -> Option<String> {
        None
    }

    fn unsubscribe_frame(&self, _key: &SubscriptionKey) -> Option<String> {
        None
    }

    fn heartbeat_frame(&self) -> HeartbeatFrame {
        HeartbeatFrame::Ping
    }
}
