//! Hub Configuration Settings
//!
//! Runtime settings for the feed hub, loaded from environment variables.
//! The market directory (feeds and symbols) lives in a separate YAML file,
//! see [`super::directory`].

use std::path::PathBuf;
use std::time::Duration;

/// Default location of the market directory file.
pub const DEFAULT_DIRECTORY_PATH: &str = "config/markets.yaml";

/// Upstream connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Silence after a ping before the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Delay before the first reconnect attempt.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnect delay.
    pub reconnect_delay_max: Duration,
    /// Delay multiplier per attempt (1.0 = fixed delay).
    pub reconnect_delay_multiplier: f64,
    /// Reconnect attempts before the feed is declared unavailable.
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_delay_initial: Duration::from_secs(3),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 1.0,
            max_reconnect_attempts: 5,
        }
    }
}

/// Consumer fan-out settings.
#[derive(Debug, Clone)]
pub struct FanoutSettings {
    /// Queue depth of each consumer endpoint.
    pub endpoint_capacity: usize,
    /// Snapshot emission cadence.
    pub emit_interval: Duration,
    /// Capacity of each feed's inbound event channel.
    pub feed_event_capacity: usize,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            endpoint_capacity: 1_024,
            emit_interval: Duration::from_secs(1),
            feed_event_capacity: 4_096,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health, metrics and snapshot HTTP port (0 = disabled).
    pub health_port: u16,
    /// Timeout for seed snapshot requests.
    pub snapshot_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            health_port: 8083,
            snapshot_timeout: Duration::from_secs(10),
        }
    }
}

/// Complete hub configuration.
#[derive(Debug, Clone, Default)]
pub struct HubSettings {
    /// HTTP server settings.
    pub server: ServerSettings,
    /// Upstream connection settings.
    pub websocket: WebSocketSettings,
    /// Consumer fan-out settings.
    pub fanout: FanoutSettings,
    /// Market directory file.
    pub directory_path: PathBuf,
}

impl HubSettings {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let server = ServerSettings {
            health_port: parse_env_u16(
                "STREAM_HUB_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
            snapshot_timeout: parse_env_duration_secs(
                "STREAM_HUB_SNAPSHOT_TIMEOUT_SECS",
                ServerSettings::default().snapshot_timeout,
            ),
        };

        let websocket = WebSocketSettings {
            heartbeat_interval: parse_env_duration_secs(
                "STREAM_HUB_HEARTBEAT_INTERVAL_SECS",
                WebSocketSettings::default().heartbeat_interval,
            ),
            heartbeat_timeout: parse_env_duration_secs(
                "STREAM_HUB_HEARTBEAT_TIMEOUT_SECS",
                WebSocketSettings::default().heartbeat_timeout,
            ),
            reconnect_delay_initial: parse_env_duration_millis(
                "STREAM_HUB_RECONNECT_DELAY_MS",
                WebSocketSettings::default().reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                "STREAM_HUB_RECONNECT_DELAY_MAX_SECS",
                WebSocketSettings::default().reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env_f64(
                "STREAM_HUB_RECONNECT_DELAY_MULTIPLIER",
                WebSocketSettings::default().reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_env_u32(
                "STREAM_HUB_MAX_RECONNECT_ATTEMPTS",
                WebSocketSettings::default().max_reconnect_attempts,
            ),
        };

        let fanout = FanoutSettings {
            endpoint_capacity: parse_env_usize(
                "STREAM_HUB_ENDPOINT_CAPACITY",
                FanoutSettings::default().endpoint_capacity,
            ),
            emit_interval: parse_env_duration_millis(
                "STREAM_HUB_EMIT_INTERVAL_MS",
                FanoutSettings::default().emit_interval,
            ),
            feed_event_capacity: parse_env_usize(
                "STREAM_HUB_FEED_EVENT_CAPACITY",
                FanoutSettings::default().feed_event_capacity,
            ),
        };

        let directory_path = std::env::var("MARKET_DIRECTORY_PATH")
            .ok()
            .filter(|v| !v.is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_DIRECTORY_PATH), PathBuf::from);

        let settings = Self {
            server,
            websocket,
            fanout,
            directory_path,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.websocket.reconnect_delay_multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "reconnect_delay_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.websocket.heartbeat_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "heartbeat_interval must be positive".to_string(),
            ));
        }
        if self.websocket.heartbeat_timeout <= self.websocket.heartbeat_interval {
            return Err(ConfigError::ValidationError(
                "heartbeat_timeout must exceed heartbeat_interval".to_string(),
            ));
        }
        if self.fanout.endpoint_capacity == 0 || self.fanout.feed_event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "channel capacities must be positive".to_string(),
            ));
        }
        if self.fanout.emit_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "emit_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the market directory file.
    #[error("failed to read market directory '{path}': {source}")]
    ReadError {
        /// Path to the file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },
    /// Failed to parse the market directory YAML.
    #[error("failed to parse market directory YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),
    /// A setting or directory entry is invalid.
    #[error("config validation failed: {0}")]
    ValidationError(String),
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
