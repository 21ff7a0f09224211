// =============================================================================
// Market regime hint
// =============================================================================
//
// A coarse classification fed to agents as an opaque string:
//   trending  -- ADX above the trend threshold
//   volatile  -- wide Bollinger bands without directional strength
//   ranging   -- everything else
//
// Deliberately crude; agents treat it as a hint, never as a gate.
// =============================================================================

use crate::indicators::{adx, bollinger};
use crate::market_data::OhlcBar;

const ADX_TREND_THRESHOLD: f64 = 25.0;
const BB_WIDTH_VOLATILE_PCT: f64 = 4.0;

/// Classify the recent bars. `None` when the window is too short to say
/// anything.
pub fn classify(bars: &[OhlcBar]) -> Option<String> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    let adx_14 = adx::adx(bars, 14)?;
    let bb = bollinger::bollinger(&closes, 20, 2.0)?;

    if adx_14 >= ADX_TREND_THRESHOLD {
        return Some("trending".to_string());
    }

    let width_pct = if bb.mid != 0.0 {
        (bb.upper - bb.lower) / bb.mid * 100.0
    } else {
        0.0
    };
    if width_pct >= BB_WIDTH_VOLATILE_PCT {
        Some("volatile".to_string())
    } else {
        Some("ranging".to_string())
    }
}
