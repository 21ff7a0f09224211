// =============================================================================
// Volume-Weighted Average Price (VWAP)
// =============================================================================
//
// Cumulative since session start over typical price (H+L+C)/3:
//   VWAP = sum(typical * volume) / sum(volume)
//
// The caller slices the bars belonging to the current session; session
// boundary handling lives in the indicator engine.
// =============================================================================

use crate::market_data::OhlcBar;

/// VWAP over the given session bars (oldest first).
///
/// Returns `None` for an empty slice, zero cumulative volume, or non-finite
/// input.
pub fn session_vwap(bars: &[OhlcBar]) -> Option<f64> {
    if bars.is_empty() {
        return None;
    }

    let mut cum_pv = 0.0;
    let mut cum_vol = 0.0;
    for bar in bars {
        let typical = (bar.high + bar.low + bar.close) / 3.0;
        if !typical.is_finite() || !bar.volume.is_finite() {
            return None;
        }
        cum_pv += typical * bar.volume;
        cum_vol += bar.volume;
    }

    if cum_vol <= 0.0 {
        return None;
    }

    let value = cum_pv / cum_vol;
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

/// Session day index for a bar timestamp, given the daily boundary expressed
/// as a fixed offset from UTC in minutes (IST = +330: the session rolls at
/// midnight local time).
pub fn session_day(ts_ms: i64, offset_minutes: i64) -> i64 {
    const DAY_MS: i64 = 86_400_000;
    (ts_ms + offset_minutes * 60_000).div_euclid(DAY_MS)
}
