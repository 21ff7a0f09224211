// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free indicator math (one file per family; every public
// function returns `Option` so callers must handle short windows and
// numerical edge cases) plus the engine that maintains rolling windows per
// (instrument, timeframe) and recomputes the full set on every bar close.

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod engine;
pub mod macd;
pub mod rsi;
pub mod sma;
pub mod vwap;

pub use engine::IndicatorEngine;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::Timeframe;

/// The fixed indicator name space published on every bar close.
///
/// A value is `null` on the wire whenever its window is insufficient or an
/// input was non-finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub instrument: String,
    pub timeframe: Timeframe,
    /// Close time of the bar this set was computed from (ms since epoch).
    pub ts: i64,

    pub rsi_14: Option<f64>,
    pub macd_value: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_hist: Option<f64>,
    pub atr_14: Option<f64>,
    pub sma_20: Option<f64>,
    pub sma_50: Option<f64>,
    pub ema_20: Option<f64>,
    pub ema_50: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_mid: Option<f64>,
    pub bb_lower: Option<f64>,
    pub adx_14: Option<f64>,
    pub vwap: Option<f64>,
    pub volume_sma: Option<f64>,
    pub volume_ratio: Option<f64>,
}

impl IndicatorSet {
    /// Every name in the set, in wire order.
    pub const NAMES: [&'static str; 16] = [
        "rsi_14",
        "macd_value",
        "macd_signal",
        "macd_hist",
        "atr_14",
        "sma_20",
        "sma_50",
        "ema_20",
        "ema_50",
        "bb_upper",
        "bb_mid",
        "bb_lower",
        "adx_14",
        "vwap",
        "volume_sma",
        "volume_ratio",
    ];

    /// Look up an indicator by its wire name.
    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "rsi_14" => self.rsi_14,
            "macd_value" => self.macd_value,
            "macd_signal" => self.macd_signal,
            "macd_hist" => self.macd_hist,
            "atr_14" => self.atr_14,
            "sma_20" => self.sma_20,
            "sma_50" => self.sma_50,
            "ema_20" => self.ema_20,
            "ema_50" => self.ema_50,
            "bb_upper" => self.bb_upper,
            "bb_mid" => self.bb_mid,
            "bb_lower" => self.bb_lower,
            "adx_14" => self.adx_14,
            "vwap" => self.vwap,
            "volume_sma" => self.volume_sma,
            "volume_ratio" => self.volume_ratio,
            _ => None,
        }
    }

    /// The non-null values as a field map (condition evaluation input).
    pub fn fields(&self) -> HashMap<String, f64> {
        Self::NAMES
            .iter()
            .filter_map(|&name| self.get(name).map(|v| (name.to_string(), v)))
            .collect()
    }
}
