//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, feed status reporting, price snapshots
//! and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status with per-feed detail
//! - `GET /healthz` - liveness probe (simple OK)
//! - `GET /readyz` - readiness probe (at least one feed open)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /snapshot/{namespace}` - current price map of one namespace

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{FeedSummary, MarketDataService};
use crate::domain::market::{Namespace, PriceSnapshot};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::upstream::ConnectionPhase;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Hub version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Attached clients.
    pub clients: usize,
    /// Registered fan-out endpoints.
    pub endpoints: usize,
    /// Per-source detail, in directory order.
    pub feeds: Vec<FeedSummary>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every feed is open.
    Healthy,
    /// Some feeds are open.
    Degraded,
    /// No feed is open.
    Unhealthy,
}

/// Body of `/snapshot/{namespace}`.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotResponse {
    /// Source namespace.
    pub namespace: Namespace,
    /// Symbol to price.
    pub prices: PriceSnapshot,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    service: MarketDataService,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, service: MarketDataService) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            service,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Routes served by the health server.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/snapshot/{namespace}", get(snapshot_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let is_ready = state
        .service
        .feed_summaries()
        .iter()
        .any(|feed| feed.status.phase == ConnectionPhase::Open);

    if is_ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn snapshot_handler(
    State(state): State<Arc<HealthServerState>>,
    Path(namespace): Path<String>,
) -> Response {
    let namespace = Namespace::new(namespace);
    match state.service.snapshot(&namespace) {
        Some(prices) => Json(SnapshotResponse { namespace, prices }).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            format!("unknown namespace: {namespace}"),
        )
            .into_response(),
    }
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let feeds = state.service.feed_summaries();
    let status = determine_health_status(&feeds);

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        clients: state.service.client_count(),
        endpoints: state.service.endpoint_count(),
        feeds,
    }
}

fn determine_health_status(feeds: &[FeedSummary]) -> HealthStatus {
    let open = feeds
        .iter()
        .filter(|feed| feed.status.phase == ConnectionPhase::Open)
        .count();

    match open {
        0 => HealthStatus::Unhealthy,
        n if n == feeds.len() => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
