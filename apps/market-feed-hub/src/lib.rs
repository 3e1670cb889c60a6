#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Feed Hub - Real-time Price Aggregation and Subscription Multiplexer
//!
//! Maintains one persistent streaming connection per upstream price source,
//! merges each source's prices into a per-namespace snapshot, and shares
//! upstream bar/price subscriptions between any number of in-process
//! consumers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Canonical types and shared state, no I/O
//!   - `market`: Namespaces, resolutions, subscription keys, prices, bars
//!   - `prices`: Per-namespace price aggregation with seed buffering
//!   - `subscription`: Reference-counted subscription multiplexing
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Streaming transport and snapshot source interfaces
//!   - `services`: Market data service, feed routing, snapshot emission
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `upstream`: Connection actors, wire codecs, WebSocket and HTTP adapters
//!   - `broadcast`: Fan-out of hub events to consumer endpoints
//!   - `config`: Environment settings and the YAML market directory
//!   - `health`: Health, readiness, metrics and snapshot HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! hyperliquid WS ──┐   ┌──────────────┐   ┌─────────────┐
//!                  ├──►│  Connection  │──►│ Feed router │──► Aggregator ──► Emitter ──┐
//! pyth WS ─────────┤   │    actors    │   └─────────────┘                              │
//!                  │   └──────────────┘          │                                     ▼
//! gains WS ────────┘          ▲                  └──► Multiplexer handlers       Fan-out hub
//!                             └──── subscribe / replay ───┘                      ──► clients
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market data types and shared state with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{
    Bar, BarEvent, MarketEvent, Namespace, PriceBatch, PriceSnapshot, PriceUpdate, Resolution,
    SubscriptionKey,
};
pub use domain::prices::{PriceAggregator, SeedState};
pub use domain::subscription::{
    ActiveSubscriptionRegistry, EventHandler, MultiplexerStats, OutboundFrame, ReconnectHook,
    SubscriberId, SubscriptionMultiplexer, UpstreamSink,
};

// Ports
pub use application::ports::{SeedError, SnapshotSource, StreamConnector, StreamTransport};

// Services
pub use application::services::{
    BarSubscription, ClientHandle, MarketDataError, MarketDataService, PriceWatch,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, Dialect, FanoutSettings, FeedConfig, HubSettings, MarketDirectory,
    ServerSettings, SymbolMapping, WebSocketSettings, load_directory,
};

// Upstream connections
pub use infrastructure::upstream::{
    ConnectionError, ConnectionHandle, ConnectionPhase, ConnectionStatus, FeedEvent,
    HttpSnapshotSource, TungsteniteConnector,
};

// Fan-out
pub use infrastructure::broadcast::{BroadcastReport, FanoutHub, HubEvent};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
