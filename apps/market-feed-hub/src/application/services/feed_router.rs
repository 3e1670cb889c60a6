//! Feed Router
//!
//! Consumes one connection's [`FeedEvent`]s and routes them: decoded prices
//! into the namespace's aggregator, prices and bars to the multiplexer's
//! handlers, and connection status changes to every fan-out endpoint.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::domain::market::{MarketEvent, Namespace, SubscriptionKey};
use crate::domain::prices::PriceAggregator;
use crate::domain::subscription::SubscriptionMultiplexer;
use crate::infrastructure::broadcast::{FanoutHub, HubEvent};
use crate::infrastructure::metrics;
use crate::infrastructure::upstream::{ConnectionStatus, Decoded, FeedEvent};

/// Routes the events of one upstream source.
pub struct FeedRouter {
    namespace: Namespace,
    aggregator: Arc<PriceAggregator>,
    multiplexer: Arc<SubscriptionMultiplexer>,
    hub: Arc<FanoutHub>,
    status: watch::Receiver<ConnectionStatus>,
    seen_panics: u64,
}

impl FeedRouter {
    /// Create a router for one source.
    #[must_use]
    pub fn new(
        namespace: Namespace,
        aggregator: Arc<PriceAggregator>,
        multiplexer: Arc<SubscriptionMultiplexer>,
        hub: Arc<FanoutHub>,
        status: watch::Receiver<ConnectionStatus>,
    ) -> Self {
        let seen_panics = multiplexer.handler_panics();
        Self {
            namespace,
            aggregator,
            multiplexer,
            hub,
            status,
            seen_panics,
        }
    }

    /// Route events until the channel closes or `cancel` fires.
    pub async fn run(mut self, mut events: mpsc::Receiver<FeedEvent>, cancel: CancellationToken) {
        tracing::debug!(namespace = %self.namespace, "Feed router started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.route(event),
                    None => break,
                },
            }
        }
        tracing::debug!(namespace = %self.namespace, "Feed router stopped");
    }

    /// Route a single event.
    pub fn route(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Decoded(decoded) => self.route_decoded(decoded),
            FeedEvent::Connected => {
                tracing::info!(namespace = %self.namespace, "Feed connected");
                self.broadcast_status();
            }
            FeedEvent::Disconnected { reason } => {
                tracing::warn!(namespace = %self.namespace, reason = %reason, "Feed disconnected");
                self.broadcast_status();
            }
            FeedEvent::Reconnecting { attempt, delay } => {
                tracing::info!(
                    namespace = %self.namespace,
                    attempt,
                    delay_ms = delay.as_millis(),
                    "Feed reconnecting"
                );
                self.broadcast_status();
            }
            FeedEvent::Unavailable { attempts } => {
                tracing::error!(
                    namespace = %self.namespace,
                    attempts,
                    "Feed unavailable until restarted"
                );
                self.broadcast_status();
            }
        }
    }

    fn route_decoded(&mut self, decoded: Decoded) {
        let Decoded { prices, bars } = decoded;

        for update in &prices {
            let key = SubscriptionKey::price(update.symbol.clone());
            self.multiplexer
                .dispatch(&key, &MarketEvent::Price(update.clone()));
        }
        for bar in bars {
            let key = bar.key.clone();
            self.multiplexer.dispatch(&key, &MarketEvent::Bar(bar));
        }

        let changed = self.aggregator.ingest(prices);
        if changed > 0 {
            tracing::trace!(namespace = %self.namespace, changed, "Prices merged");
        }

        let panics = self.multiplexer.handler_panics();
        if panics > self.seen_panics {
            metrics::record_handler_panics(panics - self.seen_panics);
            self.seen_panics = panics;
        }
    }

    fn broadcast_status(&self) {
        let status = self.status.borrow().clone();
        self.hub.broadcast(HubEvent::FeedStatus {
            namespace: self.namespace.clone(),
            status,
        });
    }
}
