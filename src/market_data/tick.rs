// =============================================================================
// Tick model & instrument canonicalization
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single price/volume observation for one instrument.
///
/// `ts` is milliseconds since the Unix epoch. `volume` is the quantity traded
/// at this tick (not a session-cumulative figure). Depth fields are optional
/// because not every vendor feed carries them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument: String,
    pub ts: i64,
    pub last_price: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oi: Option<f64>,
}

impl Tick {
    /// Whether every numeric field is finite. Non-finite ticks are invalid
    /// input: dropped at ingestion and counted, never propagated.
    pub fn is_finite(&self) -> bool {
        let opt_ok = |v: Option<f64>| v.map_or(true, f64::is_finite);
        self.last_price.is_finite()
            && self.volume.is_finite()
            && opt_ok(self.bid)
            && opt_ok(self.ask)
            && opt_ok(self.oi)
    }
}

// =============================================================================
// InstrumentMap
// =============================================================================

/// Resolves vendor-specific symbols to one canonical instrument name.
///
/// Canonical form is upper-case with surrounding whitespace stripped; known
/// aliases (e.g. `NSE:NIFTY50` -> `NIFTY`) are applied after normalization.
#[derive(Debug, Clone, Default)]
pub struct InstrumentMap {
    aliases: HashMap<String, String>,
}

impl InstrumentMap {
    pub fn new(aliases: HashMap<String, String>) -> Self {
        // Normalize alias keys the same way lookups are normalized.
        let aliases = aliases
            .into_iter()
            .map(|(k, v)| (k.trim().to_uppercase(), v.trim().to_uppercase()))
            .collect();
        Self { aliases }
    }

    /// Canonical instrument name for a vendor symbol.
    pub fn canonical(&self, symbol: &str) -> String {
        let normalized = symbol.trim().to_uppercase();
        self.aliases
            .get(&normalized)
            .cloned()
            .unwrap_or(normalized)
    }
}
