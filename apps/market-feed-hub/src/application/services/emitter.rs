//! Snapshot Emitter
//!
//! Periodically broadcasts the full price map of every namespace that
//! changed since the previous tick. Quiet namespaces are not re-sent. Each
//! tick also retries status events held for full endpoints.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::domain::prices::PriceAggregator;
use crate::infrastructure::broadcast::{FanoutHub, HubEvent};
use crate::infrastructure::metrics;

/// Emits dirty snapshots on a fixed cadence.
pub struct SnapshotEmitter {
    aggregators: Vec<Arc<PriceAggregator>>,
    hub: Arc<FanoutHub>,
    interval: Duration,
}

impl SnapshotEmitter {
    /// Create an emitter over `aggregators`.
    #[must_use]
    pub const fn new(
        aggregators: Vec<Arc<PriceAggregator>>,
        hub: Arc<FanoutHub>,
        interval: Duration,
    ) -> Self {
        Self {
            aggregators,
            hub,
            interval,
        }
    }

    /// Broadcast every changed snapshot once. Returns how many were sent.
    pub fn emit_dirty(&self) -> usize {
        let mut emitted = 0;
        for aggregator in &self.aggregators {
            let Some(prices) = aggregator.take_if_dirty() else {
                continue;
            };
            let namespace = aggregator.namespace().clone();
            metrics::record_snapshot_emitted(namespace.as_str());
            self.hub.broadcast(HubEvent::Snapshot {
                namespace,
                prices: Arc::new(prices),
            });
            emitted += 1;
        }
        emitted
    }

    /// Emit on every tick until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;

        tracing::debug!(
            interval_ms = self.interval.as_millis(),
            namespaces = self.aggregators.len(),
            "Snapshot emitter started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.hub.flush_held();
                    let emitted = self.emit_dirty();
                    if emitted > 0 {
                        tracing::trace!(emitted, "Snapshots emitted");
                    }
                }
            }
        }

        tracing::debug!("Snapshot emitter stopped");
    }
}
