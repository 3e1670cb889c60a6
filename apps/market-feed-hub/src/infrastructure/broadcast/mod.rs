//! Broadcast Fan-out
//!
//! Delivers hub-wide events (price snapshots, feed status) to every
//! registered consumer endpoint.
//!
//! # Design
//!
//! Each endpoint owns a bounded mpsc queue. Broadcasting never blocks, and
//! an endpoint whose receiver is gone is unregistered on the spot. One slow
//! consumer therefore cannot hold up the others.
//!
//! What a full queue costs depends on the event:
//!
//! - A [`HubEvent::Snapshot`] is dropped (warned and counted). Snapshots
//!   carry the whole price map, so the next change repairs the gap, and
//!   `ClientHandle::get_snapshot` is the authoritative pull.
//! - A [`HubEvent::FeedStatus`] is held for that endpoint, latest per
//!   namespace, and delivered ahead of anything broadcast later. A terminal
//!   status therefore always arrives.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::domain::market::{Namespace, PriceSnapshot};
use crate::infrastructure::metrics;
use crate::infrastructure::upstream::ConnectionStatus;

// =============================================================================
// Events
// =============================================================================

/// Event delivered to every endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// Full price snapshot of one namespace after it changed.
    Snapshot {
        /// Source namespace.
        namespace: Namespace,
        /// Symbol to price, shared between endpoints.
        prices: Arc<PriceSnapshot>,
    },
    /// Connection status change of one namespace. `terminal` marks a feed
    /// that gave up after its retry budget.
    FeedStatus {
        /// Source namespace.
        namespace: Namespace,
        /// New status.
        status: ConnectionStatus,
    },
}

impl HubEvent {
    /// Metric label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::FeedStatus { .. } => "feed_status",
        }
    }

    /// Namespace the event is about.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        match self {
            Self::Snapshot { namespace, .. } | Self::FeedStatus { namespace, .. } => namespace,
        }
    }
}

// =============================================================================
// Endpoints
// =============================================================================

/// Identifier of a registered endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "endpoint-{}", self.0)
    }
}

/// Receiving side of a registered endpoint.
#[derive(Debug)]
pub struct Endpoint {
    /// Identifier used to unregister.
    pub id: EndpointId,
    /// Events in broadcast order.
    pub rx: mpsc::Receiver<HubEvent>,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Endpoints that queued the event.
    pub delivered: usize,
    /// Endpoints that were full and missed it.
    pub dropped: usize,
    /// Endpoints that were full and hold the status event for later.
    pub held: usize,
    /// Endpoints found closed and removed.
    pub closed: usize,
}

// =============================================================================
// Hub
// =============================================================================

/// Registry of consumer endpoints.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use market_feed_hub::domain::market::Namespace;
/// use market_feed_hub::infrastructure::broadcast::{FanoutHub, HubEvent};
///
/// let hub = FanoutHub::new();
/// let mut endpoint = hub.register(8);
///
/// let report = hub.broadcast(HubEvent::Snapshot {
///     namespace: Namespace::new("hyperliquid"),
///     prices: Arc::default(),
/// });
///
/// assert_eq!(report.delivered, 1);
/// assert!(endpoint.rx.try_recv().is_ok());
/// ```
#[derive(Debug, Default)]
pub struct FanoutHub {
    endpoints: RwLock<HashMap<EndpointId, Slot>>,
    next_id: AtomicU64,
}

/// Sending side of one endpoint.
#[derive(Debug)]
struct Slot {
    tx: mpsc::Sender<HubEvent>,
    /// Status events that did not fit, in arrival order, one per namespace.
    held: Mutex<VecDeque<HubEvent>>,
}

enum Delivery {
    Queued,
    Full,
    Closed,
}

impl Slot {
    fn new(tx: mpsc::Sender<HubEvent>) -> Self {
        Self {
            tx,
            held: Mutex::new(VecDeque::new()),
        }
    }

    /// Move held events into the queue while it has room.
    fn flush(&self, held: &mut VecDeque<HubEvent>) -> Delivery {
        while let Some(next) = held.front() {
            match self.tx.try_send(next.clone()) {
                Ok(()) => {
                    held.pop_front();
                }
                Err(TrySendError::Full(_)) => return Delivery::Full,
                Err(TrySendError::Closed(_)) => return Delivery::Closed,
            }
        }
        Delivery::Queued
    }

    fn deliver(&self, event: &HubEvent) -> Delivery {
        let mut held = self.held.lock();
        let outcome = match self.flush(&mut held) {
            Delivery::Queued => match self.tx.try_send(event.clone()) {
                Ok(()) => Delivery::Queued,
                Err(TrySendError::Full(_)) => Delivery::Full,
                Err(TrySendError::Closed(_)) => Delivery::Closed,
            },
            other => other,
        };
        if matches!(outcome, Delivery::Full) && matches!(event, HubEvent::FeedStatus { .. }) {
            held.retain(|e| e.namespace() != event.namespace());
            held.push_back(event.clone());
        }
        outcome
    }
}

impl FanoutHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint with a queue of `capacity` events.
    #[must_use]
    pub fn register(&self, capacity: usize) -> Endpoint {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = EndpointId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let count = {
            let mut endpoints = self.endpoints.write();
            endpoints.insert(id, Slot::new(tx));
            endpoints.len()
        };
        metrics::set_endpoints(count);
        tracing::debug!(endpoint = %id, capacity, "Endpoint registered");

        Endpoint { id, rx }
    }

    /// Remove an endpoint. Returns whether it was registered.
    pub fn unregister(&self, id: EndpointId) -> bool {
        let (removed, count) = {
            let mut endpoints = self.endpoints.write();
            let removed = endpoints.remove(&id).is_some();
            (removed, endpoints.len())
        };
        if removed {
            metrics::set_endpoints(count);
            tracing::debug!(endpoint = %id, "Endpoint unregistered");
        }
        removed
    }

    /// Deliver `event` to every endpoint without blocking.
    pub fn broadcast(&self, event: HubEvent) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut closed = Vec::new();

        {
            let endpoints = self.endpoints.read();
            for (id, slot) in endpoints.iter() {
                match slot.deliver(&event) {
                    Delivery::Queued => report.delivered += 1,
                    Delivery::Full if matches!(event, HubEvent::FeedStatus { .. }) => {
                        report.held += 1;
                        tracing::warn!(
                            endpoint = %id,
                            namespace = %event.namespace(),
                            "Endpoint queue full, status held"
                        );
                    }
                    Delivery::Full => {
                        report.dropped += 1;
                        tracing::warn!(
                            endpoint = %id,
                            event = event.kind(),
                            namespace = %event.namespace(),
                            "Endpoint queue full, event dropped"
                        );
                    }
                    Delivery::Closed => closed.push(*id),
                }
            }
        }

        report.closed = self.remove_closed(&closed);
        metrics::record_broadcast(event.kind(), report.delivered as u64, report.dropped as u64);
        report
    }

    /// Retry held status events on every endpoint. Returns how many
    /// endpoints still hold some.
    pub fn flush_held(&self) -> usize {
        let mut waiting = 0;
        let mut closed = Vec::new();
        {
            let endpoints = self.endpoints.read();
            for (id, slot) in endpoints.iter() {
                let mut held = slot.held.lock();
                match slot.flush(&mut held) {
                    Delivery::Queued => {}
                    Delivery::Full => waiting += 1,
                    Delivery::Closed => closed.push(*id),
                }
            }
        }
        self.remove_closed(&closed);
        waiting
    }

    fn remove_closed(&self, closed: &[EndpointId]) -> usize {
        if !closed.is_empty() {
            let count = {
                let mut endpoints = self.endpoints.write();
                for id in closed {
                    endpoints.remove(id);
                }
                endpoints.len()
            };
            metrics::set_endpoints(count);
            tracing::debug!(closed = closed.len(), "Removed closed endpoints");
        }
        closed.len()
    }

    /// Registered endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.read().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
