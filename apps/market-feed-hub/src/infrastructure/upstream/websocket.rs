//! WebSocket Connector
//!
//! Production [`StreamConnector`] backed by `tokio-tungstenite` over rustls.
//! The stream is split once and both halves are boxed so the connection
//! actor never sees the concrete socket type.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::application::ports::{StreamConnector, StreamTransport};

/// Opens `ws://` and `wss://` connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StreamConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<StreamTransport, WsError> {
        let (ws_stream, response) = tokio_tungstenite::connect_async(url).await?;
        tracing::debug!(url, status = %response.status(), "WebSocket handshake complete");

        let (write, read) = ws_stream.split();
        Ok(StreamTransport {
            sink: Box::pin(write),
            stream: Box::pin(read),
        })
    }
}
