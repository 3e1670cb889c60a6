//! Source-native identifier to canonical symbol mapping.

use std::collections::HashMap;

use crate::domain::market::{PriceUpdate, Symbol};
use crate::infrastructure::config::SymbolMapping;

#[derive(Debug, Clone)]
struct Entry {
    symbol: Symbol,
    scale: Option<f64>,
}

/// Read-only identifier mapping for one upstream source.
#[derive(Debug, Clone, Default)]
pub struct SymbolDirectory {
    by_native: HashMap<String, Entry>,
    by_symbol: HashMap<Symbol, String>,
    natives: Vec<String>,
}

impl SymbolDirectory {
    /// Build from configured mappings, preserving their order.
    #[must_use]
    pub fn new(mappings: &[SymbolMapping]) -> Self {
        let mut directory = Self::default();
        for mapping in mappings {
            directory.natives.push(mapping.native.clone());
            directory
                .by_symbol
                .entry(mapping.symbol.clone())
                .or_insert_with(|| mapping.native.clone());
            directory.by_native.insert(
                mapping.native.clone(),
                Entry {
                    symbol: mapping.symbol.clone(),
                    scale: mapping.scale,
                },
            );
        }
        directory
    }

    /// Canonical symbol for a native identifier.
    #[must_use]
    pub fn symbol(&self, native: &str) -> Option<&str> {
        self.by_native.get(native).map(|e| e.symbol.as_str())
    }

    /// Native identifier for a canonical symbol.
    #[must_use]
    pub fn native(&self, symbol: &str) -> Option<&str> {
        self.by_symbol.get(symbol).map(String::as_str)
    }

    /// Native identifiers in configuration order.
    #[must_use]
    pub fn natives(&self) -> &[String] {
        &self.natives
    }

    /// Map and scale a raw price. `None` for unmapped identifiers.
    #[must_use]
    pub fn normalize(&self, native: &str, raw: f64) -> Option<PriceUpdate> {
        let entry = self.by_native.get(native)?;
        let price = entry.scale.map_or(raw, |scale| raw * scale);
        price
            .is_finite()
            .then(|| PriceUpdate::new(entry.symbol.clone(), price))
    }

    /// Like [`normalize`](Self::normalize), but unmapped identifiers pass
    /// through as their own symbol, unscaled.
    #[must_use]
    pub fn normalize_or_passthrough(&self, native: &str, raw: f64) -> Option<PriceUpdate> {
        if self.by_native.contains_key(native) {
            return self.normalize(native, raw);
        }
        raw.is_finite().then(|| PriceUpdate::new(native, raw))
    }

    /// Symbol and price multiplier for a native identifier. Unmapped
    /// identifiers pass through as their own symbol with a multiplier of 1.
    #[must_use]
    pub fn resolve_or_passthrough<'a>(&'a self, native: &'a str) -> (&'a str, f64) {
        self.by_native
            .get(native)
            .map_or((native, 1.0), |e| (e.symbol.as_str(), e.scale.unwrap_or(1.0)))
    }

    /// Native identifier for a symbol, or the symbol itself.
    #[must_use]
    pub fn native_or_passthrough<'a>(&'a self, symbol: &'a str) -> &'a str {
        self.native(symbol).unwrap_or(symbol)
    }

    /// Number of mapped identifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_native.len()
    }

    /// Whether no identifier is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_native.is_empty()
    }
}
