//! Market Feed Hub Binary
//!
//! Starts the hub: connects every configured source, keeps the price maps
//! current, and serves health, metrics and snapshots over HTTP.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-feed-hub
//! ```
//!
//! # Environment Variables
//!
//! - `MARKET_DIRECTORY_PATH`: Market directory YAML (default: config/markets.yaml)
//! - `STREAM_HUB_HEALTH_PORT`: Health check HTTP port (default: 8083, 0 disables)
//! - `STREAM_HUB_SNAPSHOT_TIMEOUT_SECS`: Seed snapshot timeout (default: 10)
//! - `STREAM_HUB_HEARTBEAT_INTERVAL_SECS`: Ping interval (default: 30)
//! - `STREAM_HUB_HEARTBEAT_TIMEOUT_SECS`: Silence before reconnect (default: 60)
//! - `STREAM_HUB_RECONNECT_DELAY_MS`: Reconnect delay (default: 3000)
//! - `STREAM_HUB_RECONNECT_DELAY_MAX_SECS`: Reconnect delay cap (default: 30)
//! - `STREAM_HUB_RECONNECT_DELAY_MULTIPLIER`: Delay growth (default: 1.0)
//! - `STREAM_HUB_MAX_RECONNECT_ATTEMPTS`: Retries before giving up (default: 5)
//! - `STREAM_HUB_ENDPOINT_CAPACITY`: Per-client event queue (default: 1024)
//! - `STREAM_HUB_EMIT_INTERVAL_MS`: Snapshot emission cadence (default: 1000)
//! - `STREAM_HUB_FEED_EVENT_CAPACITY`: Per-feed event queue (default: 4096)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-feed-hub)
//! - `RUST_LOG`: Log filter (default: market_feed_hub=info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_feed_hub::infrastructure::telemetry;
use market_feed_hub::{
    ClientHandle, HealthServer, HealthServerState, HttpSnapshotSource, HubEvent, HubSettings,
    MarketDataService, MarketDirectory, TungsteniteConnector, init_metrics, load_directory,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Time given to connections to close after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("rustls crypto provider already installed"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting market feed hub");

    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let settings = HubSettings::from_env().context("invalid hub settings")?;
    let directory = load_directory(&settings.directory_path).with_context(|| {
        format!(
            "failed to load market directory from {}",
            settings.directory_path.display()
        )
    })?;
    log_config(&settings, &directory);

    let shutdown_token = CancellationToken::new();

    let snapshots = HttpSnapshotSource::new(&directory, settings.server.snapshot_timeout)
        .context("failed to build snapshot client")?;
    let service = MarketDataService::new(
        settings.clone(),
        directory,
        Arc::new(TungsteniteConnector::new()),
        Arc::new(snapshots),
    );

    if settings.server.health_port > 0 {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            service.clone(),
        ));
        let health_server = HealthServer::new(
            settings.server.health_port,
            health_state,
            shutdown_token.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    // The process itself is the first consumer; it keeps the feeds running
    let client = service.attach();
    let watcher = tokio::spawn(watch_events(client, shutdown_token.clone()));

    tracing::info!("Market feed hub ready");

    await_shutdown(shutdown_token).await?;

    let _ = watcher.await;
    service.shutdown();
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    tracing::info!("Market feed hub stopped");
    Ok(())
}

/// Log hub events until shutdown. Dropping the client releases the feeds.
async fn watch_events(mut client: ClientHandle, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = client.next_event() => event,
        };
        match event {
            Some(HubEvent::FeedStatus { namespace, status }) if status.terminal => {
                tracing::error!(
                    namespace = %namespace,
                    retries = status.retries,
                    last_error = ?status.last_error,
                    "Feed unavailable, restart required"
                );
            }
            Some(HubEvent::FeedStatus { namespace, status }) => {
                tracing::debug!(namespace = %namespace, phase = %status.phase, "Feed status");
            }
            Some(HubEvent::Snapshot { namespace, prices }) => {
                tracing::trace!(namespace = %namespace, symbols = prices.len(), "Snapshot");
            }
            None => break,
        }
    }
}

/// Log the parsed configuration.
fn log_config(settings: &HubSettings, directory: &MarketDirectory) {
    tracing::info!(
        health_port = settings.server.health_port,
        feeds = directory.feeds.len(),
        bar_source = ?directory.bar_feed().map(|feed| feed.namespace.as_str()),
        max_reconnect_attempts = settings.websocket.max_reconnect_attempts,
        "Configuration loaded"
    );
    for feed in &directory.feeds {
        tracing::debug!(
            namespace = %feed.namespace,
            dialect = feed.dialect.as_str(),
            stream_url = %feed.stream_url,
            snapshot_url = ?feed.snapshot_url,
            symbols = feed.symbols.len(),
            "Feed configured"
        );
    }
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("failed to listen for Ctrl+C")?;
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
    Ok(())
}
