// =============================================================================
// Linear-regression slope — trend direction and momentum
// =============================================================================
//
// Ordinary least squares over the closing prices of the window, normalised by
// the mean close so that the result is comparable across price scales. The
// value approximates the per-bar percentage drift of the series.

use crate::sources::market_data::Candle;

/// Normalised least-squares slope of the closes, in percent per bar.
/// Positive = rising, negative = falling. `None` for fewer than two candles
/// or a degenerate (zero-mean) series.
pub fn regression_slope(candles: &[Candle]) -> Option<f64> {
    let n = candles.len();
    if n < 2 {
        return None;
    }

    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = candles.iter().map(|c| c.close).sum::<f64>() / n_f;
    if mean_y == 0.0 || !mean_y.is_finite() {
        return None;
    }

    let mut cov = 0.0;
    let mut var = 0.0;
    for (i, candle) in candles.iter().enumerate() {
        let dx = i as f64 - mean_x;
        cov += dx * (candle.close - mean_y);
        var += dx * dx;
    }
    if var == 0.0 {
        return None;
    }

    let slope = cov / var;
    let normalised = (slope / mean_y) * 100.0;
    normalised.is_finite().then_some(normalised)
}
