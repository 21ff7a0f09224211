// =============================================================================
// Bollinger Bands (20, 2σ)
// =============================================================================
//
// mid = SMA(period), band = k * population stddev of the window.

use crate::indicators::sma::sma;

/// The three Bollinger band levels for the most recent bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bollinger {
    pub upper: f64,
    pub mid: f64,
    pub lower: f64,
}

/// Bollinger bands over the last `period` closes with `k` standard deviations.
///
/// Returns `None` on an insufficient window or non-finite input.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Option<Bollinger> {
    let mid = sma(closes, period)?;

    let window = &closes[closes.len() - period..];
    let variance = window.iter().map(|x| (x - mid).powi(2)).sum::<f64>() / period as f64;
    let band = k * variance.sqrt();

    let upper = mid + band;
    let lower = mid - band;
    if upper.is_finite() && lower.is_finite() {
        Some(Bollinger { upper, mid, lower })
    } else {
        None
    }
}
