//! Market Data Types
//!
//! Canonical, source-independent representation of prices and bars.
//! Every wire dialect decodes into these types, already denominated in
//! unscaled USD.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// Canonical trading symbol (e.g. `BTC`).
pub type Symbol = String;

/// Latest known price per symbol for one upstream source.
pub type PriceSnapshot = HashMap<Symbol, f64>;

/// A decoded batch of price updates, in arrival order.
pub type PriceBatch = Vec<PriceUpdate>;

/// Upstream source namespace (one per streaming connection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    /// Create a namespace from any string-like value.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the namespace name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Namespace {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Bar interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    /// 1 minute.
    #[serde(rename = "1m")]
    OneMinute,
    /// 3 minutes.
    #[serde(rename = "3m")]
    ThreeMinutes,
    /// 5 minutes.
    #[serde(rename = "5m")]
    FiveMinutes,
    /// 15 minutes.
    #[serde(rename = "15m")]
    FifteenMinutes,
    /// 30 minutes.
    #[serde(rename = "30m")]
    ThirtyMinutes,
    /// 1 hour.
    #[serde(rename = "1h")]
    OneHour,
    /// 2 hours.
    #[serde(rename = "2h")]
    TwoHours,
    /// 4 hours.
    #[serde(rename = "4h")]
    FourHours,
    /// 8 hours.
    #[serde(rename = "8h")]
    EightHours,
    /// 12 hours.
    #[serde(rename = "12h")]
    TwelveHours,
    /// 1 day.
    #[serde(rename = "1d")]
    OneDay,
    /// 3 days.
    #[serde(rename = "3d")]
    ThreeDays,
    /// 1 week.
    #[serde(rename = "1w")]
    OneWeek,
    /// 1 month.
    #[serde(rename = "1M")]
    OneMonth,
}

impl Resolution {
    /// Interval string as used on the wire (`1m`, `1h`, `1d`, ...).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::TwoHours => "2h",
            Self::FourHours => "4h",
            Self::EightHours => "8h",
            Self::TwelveHours => "12h",
            Self::OneDay => "1d",
            Self::ThreeDays => "3d",
            Self::OneWeek => "1w",
            Self::OneMonth => "1M",
        }
    }

    /// Parse a chart-widget resolution code.
    ///
    /// Minute resolutions are plain numbers (`"1"`, `"60"`, `"240"`), longer
    /// ones carry a unit suffix (`"1D"`, `"3D"`, `"1W"`, `"1M"`).
    #[must_use]
    pub fn from_chart_code(code: &str) -> Option<Self> {
        let resolution = match code.trim() {
            "1" => Self::OneMinute,
            "3" => Self::ThreeMinutes,
            "5" => Self::FiveMinutes,
            "15" => Self::FifteenMinutes,
            "30" => Self::ThirtyMinutes,
            "60" => Self::OneHour,
            "120" => Self::TwoHours,
            "240" => Self::FourHours,
            "480" => Self::EightHours,
            "720" => Self::TwelveHours,
            "D" | "1D" => Self::OneDay,
            "3D" => Self::ThreeDays,
            "W" | "1W" => Self::OneWeek,
            "M" | "1M" => Self::OneMonth,
            _ => return None,
        };
        Some(resolution)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an interval string is not a known resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resolution: {0}")]
pub struct UnknownResolution(pub String);

impl FromStr for Resolution {
    type Err = UnknownResolution;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let resolution = match s {
            "1m" => Self::OneMinute,
            "3m" => Self::ThreeMinutes,
            "5m" => Self::FiveMinutes,
            "15m" => Self::FifteenMinutes,
            "30m" => Self::ThirtyMinutes,
            "1h" => Self::OneHour,
            "2h" => Self::TwoHours,
            "4h" => Self::FourHours,
            "8h" => Self::EightHours,
            "12h" => Self::TwelveHours,
            "1d" => Self::OneDay,
            "3d" => Self::ThreeDays,
            "1w" => Self::OneWeek,
            "1M" => Self::OneMonth,
            other => {
                return Self::from_chart_code(other)
                    .ok_or_else(|| UnknownResolution(other.to_string()));
            }
        };
        Ok(resolution)
    }
}

// =============================================================================
// Subscription Key
// =============================================================================

/// Unit of upstream subscription.
///
/// `(symbol, resolution)` for bar streams, `symbol` alone for raw prices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    /// Canonical symbol.
    pub symbol: Symbol,
    /// Bar interval, `None` for raw price keys.
    pub resolution: Option<Resolution>,
}

impl SubscriptionKey {
    /// Key for a bar stream.
    #[must_use]
    pub fn bars(symbol: impl Into<Symbol>, resolution: Resolution) -> Self {
        Self {
            symbol: symbol.into(),
            resolution: Some(resolution),
        }
    }

    /// Key for a raw price stream.
    #[must_use]
    pub fn price(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            resolution: None,
        }
    }

    /// Whether this key names a bar stream.
    #[must_use]
    pub const fn is_bars(&self) -> bool {
        self.resolution.is_some()
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resolution {
            Some(resolution) => write!(f, "{}@{}", self.symbol, resolution),
            None => f.write_str(&self.symbol),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Latest price for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceUpdate {
    /// Canonical symbol.
    pub symbol: Symbol,
    /// Price in unscaled USD.
    pub price: f64,
}

impl PriceUpdate {
    /// Create a new price update.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
        }
    }
}

/// OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bar {
    /// Bar open time (Unix ms).
    pub open_time_ms: i64,
    /// Bar close time (Unix ms), zero when the source does not report it.
    pub close_time_ms: i64,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Traded volume.
    pub volume: f64,
    /// Number of trades, zero when unknown.
    pub trades: u64,
}

/// A bar tagged with the subscription key it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct BarEvent {
    /// Bar stream key.
    pub key: SubscriptionKey,
    /// Bar payload.
    pub bar: Bar,
}

/// What subscription handlers receive.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    /// Realtime bar update.
    Bar(BarEvent),
    /// Raw price update.
    Price(PriceUpdate),
}
