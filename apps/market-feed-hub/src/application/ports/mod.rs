//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`StreamConnector`]: opens a persistent streaming connection
//! - [`SnapshotSource`]: fetches the bulk price snapshot used as seed
//!
//! The multiplexer's own seams ([`UpstreamSink`], [`ReconnectHook`]) live in
//! the domain and are re-exported here.
//!
//! [`UpstreamSink`]: crate::domain::subscription::UpstreamSink
//! [`ReconnectHook`]: crate::domain::subscription::ReconnectHook

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

pub use crate::domain::subscription::{OutboundFrame, ReconnectHook, UpstreamSink};
use crate::domain::market::{Namespace, PriceBatch};

// =============================================================================
// Stream Connector
// =============================================================================

/// Outbound half of a streaming connection.
pub type TransportSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Inbound half of a streaming connection.
pub type TransportStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// An open streaming connection, already split.
pub struct StreamTransport {
    /// Frames to upstream.
    pub sink: TransportSink,
    /// Frames from upstream.
    pub stream: TransportStream,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport").finish_non_exhaustive()
    }
}

/// Opens streaming connections.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Connect to `url`.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the handshake fails.
    async fn connect(&self, url: &str) -> Result<StreamTransport, WsError>;
}

// =============================================================================
// Snapshot Source
// =============================================================================

/// Errors fetching a seed snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    /// The namespace has no snapshot endpoint.
    #[error("no snapshot endpoint configured for {0}")]
    NotConfigured(Namespace),
    /// Request failed before a response arrived.
    #[error("snapshot request failed: {0}")]
    Transport(String),
    /// Upstream answered with a non-success status.
    #[error("snapshot endpoint returned HTTP {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },
    /// Response body could not be decoded.
    #[error("snapshot response could not be decoded: {0}")]
    Decode(String),
}

/// Fetches the bulk price snapshot of an upstream source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the current prices of `namespace`, mapped and scaled.
    ///
    /// # Errors
    ///
    /// Returns a [`SeedError`] when the snapshot is unavailable.
    async fn fetch(&self, namespace: &Namespace) -> Result<PriceBatch, SeedError>;
}
