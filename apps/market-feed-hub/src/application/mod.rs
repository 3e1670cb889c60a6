//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (streaming transport, snapshots).
pub mod ports;

/// Market data service, feed routing and snapshot emission.
pub mod services;
