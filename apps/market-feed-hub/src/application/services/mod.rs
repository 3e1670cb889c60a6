//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `MarketDataService`: owns the sources and hands out client handles
//! - `FeedRouter`: routes one connection's events to aggregator, handlers
//!   and fan-out
//! - `SnapshotEmitter`: broadcasts changed price maps on a fixed cadence

pub mod emitter;
pub mod feed_router;
pub mod market_data;

pub use emitter::SnapshotEmitter;
pub use feed_router::FeedRouter;
pub use market_data::{
    BarSubscription, ClientHandle, FeedSummary, MarketDataError, MarketDataService, PriceWatch,
    SubscriptionSummary,
};
