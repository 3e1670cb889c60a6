//! Configuration Module
//!
//! Environment settings plus the YAML market directory.

mod directory;
mod settings;

pub use directory::{
    Dialect, FeedConfig, MarketDirectory, SymbolMapping, load_directory, load_directory_from_str,
};
pub use settings::{
    ConfigError, DEFAULT_DIRECTORY_PATH, FanoutSettings, HubSettings, ServerSettings,
    WebSocketSettings,
};
