//! Market Directory
//!
//! Read-only description of the upstream sources: which namespaces exist,
//! which wire dialect each speaks, where to connect, and how source-native
//! identifiers map to canonical symbols.
//!
//! Loaded once at startup from YAML with `${VAR}` / `${VAR:-default}`
//! environment interpolation.

use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use super::settings::ConfigError;
use crate::domain::market::Namespace;

/// Wire dialect spoken by an upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Object-keyed mids dictionary plus candle channel.
    Hyperliquid,
    /// Event stream of parsed price-feed objects with exponent.
    Pyth,
    /// Flat index/price pair arrays.
    Indexed,
}

impl Dialect {
    /// Dialect name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hyperliquid => "hyperliquid",
            Self::Pyth => "pyth",
            Self::Indexed => "indexed",
        }
    }

    /// Whether the dialect can stream bars.
    #[must_use]
    pub const fn supports_bars(self) -> bool {
        matches!(self, Self::Hyperliquid)
    }
}

/// Mapping of one source-native identifier to a canonical symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolMapping {
    /// Identifier as the source sends it (ticker, feed id, pair index).
    pub native: String,
    /// Canonical trading symbol.
    pub symbol: String,
    /// Multiplier applied after decode, if the source is not in USD units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
}

/// One upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Namespace the source's prices are aggregated under.
    pub namespace: Namespace,
    /// Wire dialect.
    pub dialect: Dialect,
    /// Streaming endpoint (`ws://` or `wss://`).
    pub stream_url: String,
    /// Bulk snapshot endpoint used to seed the price map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_url: Option<String>,
    /// Identifier mapping.
    #[serde(default)]
    pub symbols: Vec<SymbolMapping>,
}

/// Every configured upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDirectory {
    /// Upstream sources, one connection each.
    pub feeds: Vec<FeedConfig>,
    /// Namespace that serves bar subscriptions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bar_source: Option<Namespace>,
}

impl MarketDirectory {
    /// Look up a feed by namespace.
    #[must_use]
    pub fn feed(&self, namespace: &Namespace) -> Option<&FeedConfig> {
        self.feeds.iter().find(|f| &f.namespace == namespace)
    }

    /// Feed that serves bar subscriptions.
    ///
    /// Falls back to the first bar-capable feed when none is named.
    #[must_use]
    pub fn bar_feed(&self) -> Option<&FeedConfig> {
        match &self.bar_source {
            Some(namespace) => self.feed(namespace),
            None => self.feeds.iter().find(|f| f.dialect.supports_bars()),
        }
    }

    /// Check the directory for structural mistakes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feeds.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one feed must be configured".to_string(),
            ));
        }

        let mut namespaces = HashSet::new();
        for feed in &self.feeds {
            let ns = feed.namespace.as_str();
            if ns.is_empty() {
                return Err(ConfigError::ValidationError(
                    "feed namespace cannot be empty".to_string(),
                ));
            }
            if !namespaces.insert(ns) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate feed namespace: {ns}"
                )));
            }
            if !(feed.stream_url.starts_with("ws://") || feed.stream_url.starts_with("wss://")) {
                return Err(ConfigError::ValidationError(format!(
                    "feed {ns}: stream_url must use ws:// or wss://"
                )));
            }
            if feed.dialect != Dialect::Hyperliquid && feed.symbols.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "feed {ns}: {} dialect requires a symbol mapping",
                    feed.dialect.as_str()
                )));
            }
            validate_symbols(feed)?;
        }

        if let Some(bar_source) = &self.bar_source {
            let Some(feed) = self.feed(bar_source) else {
                return Err(ConfigError::ValidationError(format!(
                    "bar_source {bar_source} is not a configured feed"
                )));
            };
            if !feed.dialect.supports_bars() {
                return Err(ConfigError::ValidationError(format!(
                    "bar_source {bar_source} uses the {} dialect, which has no bar stream",
                    feed.dialect.as_str()
                )));
            }
        }

        Ok(())
    }
}

fn validate_symbols(feed: &FeedConfig) -> Result<(), ConfigError> {
    let ns = feed.namespace.as_str();
    let mut natives = HashSet::new();
    for mapping in &feed.symbols {
        if !natives.insert(mapping.native.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "feed {ns}: duplicate native id {}",
                mapping.native
            )));
        }
        if let Some(scale) = mapping.scale
            && !(scale.is_finite() && scale > 0.0)
        {
            return Err(ConfigError::ValidationError(format!(
                "feed {ns}: scale for {} must be a positive number",
                mapping.symbol
            )));
        }
        if feed.dialect == Dialect::Indexed && mapping.native.parse::<usize>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "feed {ns}: native id {} is not a pair index",
                mapping.native
            )));
        }
    }
    Ok(())
}

// ============================================
// Loading
// ============================================

/// Load the market directory from a YAML file.
///
/// # Errors
///
/// Returns a `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_directory(path: &Path) -> Result<MarketDirectory, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        source: e,
    })?;

    load_directory_from_str(&contents)
}

/// Load the market directory from a YAML string.
///
/// # Errors
///
/// Returns a `ConfigError` if the YAML cannot be parsed or validated.
pub fn load_directory_from_str(yaml: &str) -> Result<MarketDirectory, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    let directory: MarketDirectory = serde_yaml_bw::from_str(&interpolated)?;
    directory.validate()?;
    Ok(directory)
}

/// Interpolate environment variables in a string.
///
/// Supports both `${VAR}` and `${VAR:-default}` syntax.
#[allow(clippy::expect_used)] // Regex is compile-time constant
fn interpolate_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var regex is valid")
    });

    re.replace_all(input, |cap: &regex::Captures<'_>| {
        let default_value = cap.get(2).map_or("", |m| m.as_str());
        match std::env::var(&cap[1]) {
            Ok(v) if !v.is_empty() => v,
            _ => default_value.to_string(),
        }
    })
    .into_owned()
}
