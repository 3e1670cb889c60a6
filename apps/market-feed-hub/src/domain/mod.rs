//! Domain Layer - Market data types and the shared-state core.
//!
//! This layer holds the canonical price/bar types, the per-namespace price
//! map and the subscription reference counting. Nothing here performs I/O;
//! upstream frames leave through the [`subscription::UpstreamSink`] seam.

/// Canonical market data types (prices, bars, subscription keys).
pub mod market;

/// Per-namespace latest-price aggregation.
pub mod prices;

/// Reference-counted subscription multiplexing.
pub mod subscription;
