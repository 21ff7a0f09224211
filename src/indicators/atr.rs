// =============================================================================
// Average True Range (ATR) -- Wilder's smoothing
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR seeds with the SMA of the first `period` TR values, then applies
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market_data::OhlcBar;

/// Most recent ATR value over `bars` (oldest first).
///
/// Returns `None` when `period` is zero, there are fewer than `period + 1`
/// bars (each TR needs a previous close), or any intermediate value is
/// non-finite.
pub fn atr(bars: &[OhlcBar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut tr_values = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        if !tr.is_finite() {
            return None;
        }
        tr_values.push(tr);
    }

    let period_f = period as f64;
    let mut value = tr_values[..period].iter().sum::<f64>() / period_f;
    if !value.is_finite() {
        return None;
    }

    for &tr in &tr_values[period..] {
        value = (value * (period_f - 1.0) + tr) / period_f;
        if !value.is_finite() {
            return None;
        }
    }

    Some(value)
}
