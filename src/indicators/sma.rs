// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================

/// Arithmetic mean of the last `period` values.
///
/// Returns `None` when `period` is zero, there are fewer than `period` values,
/// or any input in the window is non-finite.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let window = &values[values.len() - period..];
    if window.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let mean = window.iter().sum::<f64>() / period as f64;
    if mean.is_finite() {
        Some(mean)
    } else {
        None
    }
}
