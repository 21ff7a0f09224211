// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Standard recurrence, seeded with the SMA of the first `period` values:
//   alpha = 2 / (period + 1)
//   EMA_t = alpha * value_t + (1 - alpha) * EMA_{t-1}
// =============================================================================

/// Full EMA series. The first output element corresponds to input index
/// `period - 1` (the SMA seed).
///
/// Returns an empty vec when the input is too short, the period is zero, or
/// the seed is non-finite. A non-finite value mid-series stops the series --
/// consumers must not trust anything after a broken input.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let alpha = 2.0 / (period + 1) as f64;

    let seed = values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(values.len() - period + 1);
    result.push(seed);

    let mut prev = seed;
    for &v in &values[period..] {
        let next = alpha * v + (1.0 - alpha) * prev;
        if !next.is_finite() {
            break;
        }
        result.push(next);
        prev = next;
    }

    result
}

/// Most recent EMA value, or `None` when the window is insufficient.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}
