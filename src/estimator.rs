//! Forecast estimation from raw price history.
//!
//! All functions are pure over an oldest-first price slice. With fewer than
//! three samples they fall back to neutral values rather than failing.

/// Output of [`estimate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    /// Linearly weighted up-tick ratio over the long window, in [0,1]
    pub forecast: f64,
    /// Unweighted up-tick ratio over the short window, in [0,1]
    pub forecast_short: f64,
    /// Raw one-tick disagreement between the two windows
    pub inversion_raw: bool,
}

impl Estimate {
    pub fn neutral() -> Self {
        Self { forecast: 0.5, forecast_short: 0.5, inversion_raw: false }
    }
}

/// Estimate the up-probability over a long and a short window.
///
/// The long window is linearly weighted from 1.0 on its oldest transition to
/// 2.0 on its newest, so recent behavior dominates. The short window stays
/// unweighted: it feeds the flip detector, and weighting would make that
/// signal noisy.
pub fn estimate(
    history: &[f64],
    long_window: usize,
    short_window: usize,
    inversion_delta: f64,
) -> Estimate {
    let len = history.len();
    if len < 3 {
        return Estimate::neutral();
    }

    let long_w = long_window.min(len - 1).max(1);
    let mut weight_sum = 0.0;
    let mut up_sum = 0.0;
    for j in 0..long_w {
        let i = len - long_w + j;
        let w = if long_w > 1 {
            1.0 + j as f64 / (long_w as f64 - 1.0)
        } else {
            1.0
        };
        weight_sum += w;
        if history[i] > history[i - 1] {
            up_sum += w;
        }
    }
    let forecast = up_sum / weight_sum;

    let short_w = short_window.min(len - 1).max(1);
    let ups = (0..short_w)
        .filter(|j| {
            let i = len - short_w + j;
            history[i] > history[i - 1]
        })
        .count();
    let forecast_short = ups as f64 / short_w as f64;

    let opposed = (forecast > 0.5) != (forecast_short > 0.5);
    let inversion_raw = opposed && (forecast - forecast_short).abs() > inversion_delta;

    Estimate { forecast, forecast_short, inversion_raw }
}

/// Average one-tick relative move over the last min(20, len-1) transitions.
/// Returns a 0.01 floor when there are not yet two samples.
pub fn estimate_volatility(history: &[f64]) -> f64 {
    let len = history.len();
    if len < 2 {
        return 0.01;
    }
    let w = 20.min(len - 1);
    let mut sum = 0.0;
    for j in 0..w {
        let i = len - w + j;
        let prev = history[i - 1];
        if prev > 0.0 {
            sum += (history[i] - prev).abs() / prev;
        }
    }
    sum / w as f64
}

/// Signed momentum score in [-1, 1] over the last 5 transitions, weighted
/// 1.0 to 3.0 in 0.5 steps and normalized by the maximum possible sum (10).
/// Requires at least 6 samples, else 0.
pub fn calc_momentum(history: &[f64]) -> f64 {
    let len = history.len();
    if len < 6 {
        return 0.0;
    }
    let mut score = 0.0;
    for j in 0..5 {
        let i = len - 5 + j;
        let w = 1.0 + 0.5 * j as f64;
        let delta = history[i] - history[i - 1];
        if delta > 0.0 {
            score += w;
        } else if delta < 0.0 {
            score -= w;
        }
    }
    score / 10.0
}

// =============================================================================
// Tests
// =============================================================================
