//! Upstream Sources
//!
//! Everything that talks to an upstream price source: the per-dialect wire
//! codecs, the connection actor with its retry and heartbeat policies, the
//! production WebSocket connector, and the HTTP snapshot adapter.
//!
//! # Architecture
//!
//! ```text
//! StreamConnector ──► ConnectionActor ──FeedEvent──► feed router
//!                        ▲      │
//!      ConnectionHandle ─┘      └─ FeedProtocol (decode / encode)
//! ```

pub mod codec;
pub mod connection;
pub mod heartbeat;
pub mod reconnect;
pub mod snapshot;
pub mod websocket;

pub use codec::{Decoded, FeedProtocol, SymbolDirectory, protocol_for};
pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionHandle, ConnectionPhase, ConnectionStatus,
    FeedEvent,
};
pub use heartbeat::HeartbeatConfig;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use snapshot::HttpSnapshotSource;
pub use websocket::TungsteniteConnector;
