//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Upstream connections, wire codecs and snapshot fetching.
pub mod upstream;

/// Fan-out of hub events to consumer endpoints.
pub mod broadcast;

/// Runtime settings and the market directory.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
