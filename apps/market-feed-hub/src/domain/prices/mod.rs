//! Price Aggregator
//!
//! Merges decoded price batches into one symbol→price map per namespace.
//!
//! # Design
//!
//! - Merge is key-wise overwrite: a batch carries the latest value for the
//!   symbols it names, never a delta, so ingesting it twice is a no-op.
//! - Entries are never evicted; a symbol keeps its last known price.
//! - Sources with a bulk snapshot endpoint start unseeded. Stream batches
//!   arriving before the seed are buffered and replayed on top of it, so
//!   nothing older than the stream ever overwrites a streamed value.
//! - A dirty flag records whether the map changed since the last emission;
//!   the emitter polls it on a fixed cadence instead of reacting per tick.

use std::collections::VecDeque;

use parking_lot::RwLock;
use serde::Serialize;

use crate::domain::market::{Namespace, PriceBatch, PriceSnapshot, PriceUpdate};

/// Upper bound on batches buffered while waiting for the seed.
const MAX_PENDING_BATCHES: usize = 4096;

/// Seed lifecycle of one aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedState {
    /// Waiting for the bulk snapshot; stream batches are buffered.
    Pending,
    /// Seeded from the bulk snapshot.
    Seeded,
    /// Seed fetch failed; running on stream data alone.
    Failed,
    /// Source has no snapshot endpoint.
    NotRequired,
}

impl SeedState {
    /// Whether incremental updates are applied directly.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

struct AggregatorState {
    prices: PriceSnapshot,
    seed: SeedState,
    pending: VecDeque<PriceBatch>,
    dirty: bool,
}

/// Latest-price map for one namespace.
///
/// Exactly one feed router writes to an aggregator; any number of readers
/// take snapshots concurrently.
pub struct PriceAggregator {
    namespace: Namespace,
    state: RwLock<AggregatorState>,
}

impl PriceAggregator {
    /// Create an aggregator that waits for a seed before trusting the stream.
    #[must_use]
    pub fn awaiting_seed(namespace: Namespace) -> Self {
        Self::with_seed_state(namespace, SeedState::Pending)
    }

    /// Create an aggregator for a source without a snapshot endpoint.
    #[must_use]
    pub fn without_seed(namespace: Namespace) -> Self {
        Self::with_seed_state(namespace, SeedState::NotRequired)
    }

    fn with_seed_state(namespace: Namespace, seed: SeedState) -> Self {
        Self {
            namespace,
            state: RwLock::new(AggregatorState {
                prices: PriceSnapshot::new(),
                seed,
                pending: VecDeque::new(),
                dirty: false,
            }),
        }
    }

    /// Namespace this aggregator owns.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Merge a batch into the map.
    ///
    /// Returns the number of symbols whose value changed. Batches ingested
    /// before the seed arrives are buffered and report zero.
    pub fn ingest(&self, batch: PriceBatch) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let mut state = self.state.write();

        if !state.seed.is_ready() {
            if state.pending.len() >= MAX_PENDING_BATCHES {
                state.pending.pop_front();
                tracing::warn!(
                    namespace = %self.namespace,
                    "Seed buffer full, dropping oldest buffered batch"
                );
            }
            state.pending.push_back(batch);
            return 0;
        }

        apply(&mut state, &batch)
    }

    /// Seed the map from a bulk snapshot, then replay buffered batches.
    ///
    /// Has no effect once the aggregator is ready.
    pub fn seed(&self, batch: PriceBatch) -> bool {
        let mut state = self.state.write();

        if state.seed.is_ready() {
            tracing::debug!(namespace = %self.namespace, "Ignoring seed, aggregator already ready");
            return false;
        }

        apply(&mut state, &batch);
        let buffered = drain_pending(&mut state);
        state.seed = SeedState::Seeded;
        state.dirty = true;

        tracing::info!(
            namespace = %self.namespace,
            seeded = batch.len(),
            buffered,
            symbols = state.prices.len(),
            "Price map seeded"
        );
        true
    }

    /// Give up on the seed and apply buffered batches as they are.
    pub fn mark_seed_failed(&self) {
        let mut state = self.state.write();

        if state.seed.is_ready() {
            return;
        }

        let buffered = drain_pending(&mut state);
        state.seed = SeedState::Failed;

        tracing::warn!(
            namespace = %self.namespace,
            buffered,
            "Seed unavailable, continuing with stream data only"
        );
    }

    /// Independent copy of the current map.
    #[must_use]
    pub fn snapshot(&self) -> PriceSnapshot {
        self.state.read().prices.clone()
    }

    /// Latest price for one symbol.
    #[must_use]
    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.state.read().prices.get(symbol).copied()
    }

    /// Copy of the map if it changed since the last call, clearing the flag.
    pub fn take_if_dirty(&self) -> Option<PriceSnapshot> {
        let mut state = self.state.write();
        if !state.dirty {
            return None;
        }
        state.dirty = false;
        Some(state.prices.clone())
    }

    /// Current seed state.
    #[must_use]
    pub fn seed_state(&self) -> SeedState {
        self.state.read().seed
    }

    /// Number of symbols with a known price.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().prices.len()
    }

    /// Whether no price is known yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().prices.is_empty()
    }
}

fn apply(state: &mut AggregatorState, batch: &[PriceUpdate]) -> usize {
    let mut changed = 0;
    for update in batch {
        if !update.price.is_finite() {
            continue;
        }
        let previous = state.prices.insert(update.symbol.clone(), update.price);
        #[allow(clippy::float_cmp)]
        if previous != Some(update.price) {
            changed += 1;
        }
    }
    if changed > 0 {
        state.dirty = true;
    }
    changed
}

fn drain_pending(state: &mut AggregatorState) -> usize {
    let pending = std::mem::take(&mut state.pending);
    let count = pending.len();
    for batch in pending {
        apply(state, &batch);
    }
    count
}
