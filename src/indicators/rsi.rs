// =============================================================================
// Relative Strength Index (RSI) -- Wilder's smoothing
// =============================================================================
//
// Average gain / average loss are seeded with the SMA of the first `period`
// deltas, then smoothed:
//   avg = (prev_avg * (period - 1) + current) / period
//   RS  = avg_gain / avg_loss
//   RSI = 100 - 100 / (1 + RS)
// =============================================================================

/// Most recent RSI value in [0, 100].
///
/// Returns `None` when `period` is zero, there are fewer than `period + 1`
/// closes (a delta needs two closes), or the computation hits a non-finite
/// value.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    if deltas.iter().any(|d| !d.is_finite()) {
        return None;
    }

    let period_f = period as f64;
    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    rsi_from_averages(avg_gain, avg_loss)
}

/// Convert smoothed averages into an RSI value.
///
/// Flat input (both averages zero) reads as 50; all-gains reads as 100.
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let value = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    if value.is_finite() {
        Some(value)
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

    #[test]
    fn rsi_empty_and_short_input() {
        assert_eq!(rsi(&[], 14), None);
        let closes: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert_eq!(rsi(&closes, 14), None);
    }

    #[test]
    fn rsi_period_zero() {
        assert_eq!(rsi(&[1.0, 2.0, 3.0], 0), None);
    }

    #[test]
    fn rsi_monotonic_gains_approach_100() {
        let closes: Vec<f64> = (1..=40).map(|x| x as f64).collect();
        let value = rsi(&closes, 14).unwrap();
        assert!((value - 100.0).abs() < 1e-9, "expected ~100, got {value}");
    }

    #[test]
    fn rsi_monotonic_losses_approach_0() {
        let closes: Vec<f64> = (1..=40).rev().map(|x| x as f64).collect();
        let value = rsi(&closes, 14).unwrap();
        assert!(value.abs() < 1e-9, "expected ~0, got {value}");
    }

    #[test]
    fn rsi_flat_market_is_neutral() {
        let closes = vec![100.0; 40];
        assert_eq!(rsi(&closes, 14), Some(50.0));
    }

    #[test]
    fn rsi_stays_in_range() {
        let closes = [
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13, 44.01, 44.95,
        ];
        let value = rsi(&closes, 14).unwrap();
        assert!((0.0..=100.0).contains(&value));
    }

    #[test]
    fn rsi_nan_input_returns_none() {
        let mut closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        closes[10] = f64::NAN;
        assert_eq!(rsi(&closes, 14), None);
    }
}
