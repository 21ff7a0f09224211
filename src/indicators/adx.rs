// =============================================================================
// Average Directional Index (ADX) -- Wilder DI/DX/ADX
// =============================================================================
//
// Pipeline:
//   1. +DM / -DM and True Range per bar transition.
//   2. Wilder smoothing of +DM, -DM, TR.
//   3. +DI = smoothed(+DM) / smoothed(TR) * 100, same for -DI.
//   4. DX = |+DI - -DI| / (+DI + -DI) * 100.
//   5. ADX = Wilder-smoothed average of DX over `period`.
// =============================================================================

use crate::market_data::OhlcBar;

/// Most recent ADX value over `bars` (oldest first).
///
/// Needs at least `2 * period + 1` bars: `period` transitions to seed the DM/TR
/// smoothing and another `period` DX values to seed the ADX average. Returns
/// `None` below that or on non-finite intermediates.
pub fn adx(bars: &[OhlcBar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < 2 * period + 1 {
        return None;
    }

    let transitions = bars.len() - 1;
    let mut plus_dm = Vec::with_capacity(transitions);
    let mut minus_dm = Vec::with_capacity(transitions);
    let mut tr_vals = Vec::with_capacity(transitions);

    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_high = bars[i - 1].high;
        let prev_low = bars[i - 1].low;
        let prev_close = bars[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        let up_move = high - prev_high;
        let down_move = prev_low - low;

        let pdm = if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        };
        let mdm = if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        };

        if !tr.is_finite() || !pdm.is_finite() || !mdm.is_finite() {
            return None;
        }
        plus_dm.push(pdm);
        minus_dm.push(mdm);
        tr_vals.push(tr);
    }

    let period_f = period as f64;
    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(transitions - period + 1);
    dx_values.push(compute_dx(smooth_plus, smooth_minus, smooth_tr)?);

    for i in period..transitions {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];
        dx_values.push(compute_dx(smooth_plus, smooth_minus, smooth_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    let mut value = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        value = (value * (period_f - 1.0) + dx) / period_f;
        if !value.is_finite() {
            return None;
        }
    }

    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

/// DX from smoothed directional movement and true range.
fn compute_dx(smooth_plus: f64, smooth_minus: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr == 0.0 {
        return None;
    }

    let plus_di = smooth_plus / smooth_tr * 100.0;
    let minus_di = smooth_minus / smooth_tr * 100.0;

    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        // No directional movement at all.
        return Some(0.0);
    }

    let dx = (plus_di - minus_di).abs() / di_sum * 100.0;
    if dx.is_finite() {
        Some(dx)
    } else {
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> OhlcBar {
        OhlcBar {
            instrument: "BANKNIFTY".into(),
            timeframe: Timeframe::M5,
            open,
            high,
            low,
            close,
            volume: 1.0,
            start_at: 0,
            closed: true,
        }
    }

    #[test]
    fn adx_period_zero_and_short_input() {
        let bars = vec![bar(1.0, 2.0, 0.5, 1.5); 10];
        assert!(adx(&bars, 0).is_none());
        assert!(adx(&bars, 14).is_none());
    }

    #[test]
    fn adx_strong_uptrend_is_high() {
        let bars: Vec<OhlcBar> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                bar(base, base + 1.5, base - 0.5, base + 1.0)
            })
            .collect();
        let value = adx(&bars, 14).unwrap();
        assert!(value > 25.0, "expected ADX > 25 for a strong trend, got {value}");
    }

    #[test]
    fn adx_flat_market_is_near_zero() {
        let bars = vec![bar(100.0, 101.0, 99.0, 100.0); 60];
        let value = adx(&bars, 14).unwrap();
        assert!(value < 1.0, "expected ADX near 0, got {value}");
    }

    #[test]
    fn adx_stays_in_range() {
        let bars: Vec<OhlcBar> = (0..100)
            .map(|i| {
                let base = 50.0 + (i as f64 * 0.3).sin() * 10.0;
                bar(base - 0.5, base + 1.0, base - 1.0, base + 0.5)
            })
            .collect();
        if let Some(value) = adx(&bars, 14) {
            assert!((0.0..=100.0).contains(&value));
        }
    }

    #[test]
    fn adx_minimum_bars_exact() {
        let period = 5;
        let min = 2 * period + 1;
        let bars: Vec<OhlcBar> = (0..min)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(base, base + 1.0, base - 0.5, base + 0.5)
            })
            .collect();
        assert!(adx(&bars, period).is_some());
        assert!(adx(&bars[..min - 1], period).is_none());
    }
}
