//! Heartbeat Monitor
//!
//! A ping goes out every interval. A connection that receives nothing for
//! longer than the timeout after an unanswered ping is declared dead and
//! enters the normal reconnect path. Any inbound frame counts as proof of
//! life, not only the dialect's pong.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::infrastructure::config::WebSocketSettings;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Silence after a ping before the connection is considered dead.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create configuration from `WebSocketSettings`.
    #[must_use]
    pub const fn from_websocket_settings(settings: &WebSocketSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.heartbeat_timeout,
        }
    }

    /// Ticker for the connection loop. The first tick fires one interval
    /// after the connection opens.
    #[must_use]
    pub fn ticker(&self) -> Interval {
        let mut interval =
            tokio::time::interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }
}

/// What the connection should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send the dialect's ping.
    SendPing,
    /// No traffic since the last ping for longer than the timeout.
    TimedOut {
        /// Silence observed.
        silent_for: Duration,
    },
}

/// Per-connection liveness bookkeeping.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    ping_sent_at: Option<Instant>,
}

impl HeartbeatMonitor {
    /// Start monitoring a freshly opened connection.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            ping_sent_at: None,
        }
    }

    /// Record inbound traffic (data, pong, or transport pong).
    pub const fn record_activity(&mut self) {
        self.ping_sent_at = None;
    }

    /// Whether a ping is outstanding.
    #[must_use]
    pub const fn awaiting_pong(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    /// Decide what to do on a tick.
    pub fn on_tick(&mut self) -> HeartbeatAction {
        let now = Instant::now();

        // The first unanswered ping stays the reference point
        if let Some(sent_at) = self.ping_sent_at {
            let silent_for = now.saturating_duration_since(sent_at);
            if silent_for >= self.config.pong_timeout {
                return HeartbeatAction::TimedOut { silent_for };
            }
        } else {
            self.ping_sent_at = Some(now);
        }
        HeartbeatAction::SendPing
    }
}
