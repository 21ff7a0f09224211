// =============================================================================
// Moving Average Convergence Divergence (MACD 12/26/9)
// =============================================================================
//
//   MACD   = EMA_12(close) - EMA_26(close)
//   signal = EMA_9(MACD)
//   hist   = MACD - signal
// =============================================================================

use crate::indicators::ema::ema_series;

const FAST: usize = 12;
const SLOW: usize = 26;
const SIGNAL: usize = 9;

/// The three MACD outputs for the most recent bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub value: f64,
    pub signal: f64,
    pub hist: f64,
}

/// MACD(12, 26, 9) for the most recent close.
///
/// Needs at least `26 + 9 - 1 = 34` closes: the slow EMA consumes 26 to seed
/// and the signal line needs 9 MACD samples on top. Returns `None` below that
/// or on non-finite intermediate values.
pub fn macd(closes: &[f64]) -> Option<Macd> {
    if closes.len() < SLOW + SIGNAL - 1 {
        return None;
    }
    if closes.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let fast = ema_series(closes, FAST);
    let slow = ema_series(closes, SLOW);
    if slow.is_empty() {
        return None;
    }

    // Align the two series on input index: fast[i] covers input index
    // i + FAST - 1, slow[j] covers j + SLOW - 1. The MACD line starts where
    // the slow EMA starts.
    let offset = SLOW - FAST;
    let macd_line: Vec<f64> = slow
        .iter()
        .enumerate()
        .filter_map(|(j, s)| fast.get(j + offset).map(|f| f - s))
        .collect();

    if macd_line.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let signal_series = ema_series(&macd_line, SIGNAL);
    let signal = *signal_series.last()?;
    let value = *macd_line.last()?;
    let hist = value - signal;

    if value.is_finite() && signal.is_finite() && hist.is_finite() {
        Some(Macd { value, signal, hist })
    } else {
        None
    }
}
