//! Expected-return model.
//!
//! One signed number per instrument: volatility-scaled directional edge,
//! `v * (f - 0.5)`. Positive favors a long, negative a short. The forecast
//! and volatility come from the authoritative feed when that access tier is
//! granted, else from the estimator; an optional blended mode cross-validates
//! the two.

use crate::state::Instrument;

/// Blend an authoritative and an estimated forecast. When both agree on
/// direction the estimate sharpens the authoritative value; when they
/// disagree the result is damped toward neutral rather than trusting either.
pub fn blended_forecast(authoritative: f64, estimated: f64) -> f64 {
    let agree = (authoritative > 0.5) == (estimated > 0.5);
    if agree {
        0.7 * authoritative + 0.3 * estimated
    } else {
        0.85 * authoritative + 0.15 * 0.5
    }
}

/// Signed expected return for one instrument.
pub fn expected_return(inst: &Instrument, blend: bool) -> f64 {
    let (forecast, volatility) = match (inst.auth_forecast, inst.auth_volatility) {
        (Some(f), Some(v)) if blend => (blended_forecast(f, inst.est_forecast), v),
        (Some(f), Some(v)) => (f, v),
        _ => (inst.est_forecast, inst.est_volatility),
    };
    volatility * (forecast - 0.5)
}

// =============================================================================
// Tests
// =============================================================================
