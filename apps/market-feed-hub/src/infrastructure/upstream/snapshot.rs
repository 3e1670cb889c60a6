//! HTTP Snapshot Source
//!
//! Production [`SnapshotSource`]: one bulk request per namespace, shaped
//! after the feed's dialect, decoded with the same codec (and therefore the
//! same symbol mapping and scaling) as the stream.
//!
//! | Dialect | Request |
//! |---------|---------|
//! | hyperliquid | `POST <url>` with `{"type":"allMids"}` |
//! | pyth | `GET <url>?ids[]=<id>&...&parsed=true` |
//! | indexed | `GET <url>` |

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::codec::{HyperliquidProtocol, IndexedProtocol, PythProtocol, SymbolDirectory};
use crate::application::ports::{SeedError, SnapshotSource};
use crate::domain::market::{Namespace, PriceBatch};
use crate::infrastructure::config::{Dialect, FeedConfig, MarketDirectory};

enum SnapshotRequest {
    Hyperliquid(HyperliquidProtocol),
    Pyth(PythProtocol),
    Indexed(IndexedProtocol),
}

struct SnapshotTarget {
    url: String,
    request: SnapshotRequest,
}

impl SnapshotTarget {
    fn from_feed(feed: &FeedConfig) -> Option<Self> {
        let url = feed.snapshot_url.clone()?;
        let directory = SymbolDirectory::new(&feed.symbols);
        let request = match feed.dialect {
            Dialect::Hyperliquid => SnapshotRequest::Hyperliquid(HyperliquidProtocol::new(directory)),
            Dialect::Pyth => SnapshotRequest::Pyth(PythProtocol::new(directory)),
            Dialect::Indexed => SnapshotRequest::Indexed(IndexedProtocol::new(directory)),
        };
        Some(Self { url, request })
    }
}

/// Fetches seed snapshots over HTTP.
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    targets: HashMap<Namespace, SnapshotTarget>,
}

impl HttpSnapshotSource {
    /// Build a source for every feed with a `snapshot_url`.
    ///
    /// # Errors
    ///
    /// Returns [`SeedError::Transport`] if the HTTP client cannot be built.
    pub fn new(directory: &MarketDirectory, timeout: Duration) -> Result<Self, SeedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SeedError::Transport(e.to_string()))?;

        let targets = directory
            .feeds
            .iter()
            .filter_map(|feed| {
                SnapshotTarget::from_feed(feed).map(|target| (feed.namespace.clone(), target))
            })
            .collect();

        Ok(Self { client, targets })
    }

    /// Whether `namespace` has a snapshot endpoint.
    #[must_use]
    pub fn has_endpoint(&self, namespace: &Namespace) -> bool {
        self.targets.contains_key(namespace)
    }

    async fn request(&self, target: &SnapshotTarget) -> Result<Value, SeedError> {
        let builder = match &target.request {
            SnapshotRequest::Hyperliquid(_) => self
                .client
                .post(&target.url)
                .json(&json!({ "type": "allMids" })),
            SnapshotRequest::Pyth(protocol) => {
                let mut query: Vec<(&str, &str)> = protocol
                    .feed_ids()
                    .iter()
                    .map(|id| ("ids[]", id.as_str()))
                    .collect();
                query.push(("parsed", "true"));
                self.client.get(&target.url).query(&query)
            }
            SnapshotRequest::Indexed(_) => self.client.get(&target.url),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| SeedError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SeedError::Status {
                status: status.as_u16(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| SeedError::Decode(e.to_string()))
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self, namespace: &Namespace) -> Result<PriceBatch, SeedError> {
        let target = self
            .targets
            .get(namespace)
            .ok_or_else(|| SeedError::NotConfigured(namespace.clone()))?;

        let body = self.request(target).await?;
        let batch = match &target.request {
            SnapshotRequest::Hyperliquid(protocol) => protocol.decode_snapshot(&body),
            SnapshotRequest::Pyth(protocol) => protocol.decode_snapshot(&body),
            SnapshotRequest::Indexed(protocol) => protocol.decode_snapshot(&body),
        };

        tracing::debug!(
            namespace = %namespace,
            url = %target.url,
            prices = batch.len(),
            "Fetched price snapshot"
        );
        Ok(batch)
    }
}

impl std::fmt::Debug for HttpSnapshotSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSnapshotSource")
            .field("namespaces", &self.targets.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
