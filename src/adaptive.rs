//! Adaptive meta-layer.
//!
//! Watches the rolling outcome of closed trades and nudges the engine's
//! private config copy on a slow cadence: loosen when the strategy is
//! winning, tighten when it is losing. Every adjusted parameter is clamped
//! independently, so repeated nudges can never walk a threshold out of its
//! designed range.

use std::collections::VecDeque;

use crate::state::StrategyConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adjustment {
    pub win_rate: f64,
    pub loosened: bool,
}

pub struct AdaptiveController {
    outcomes: VecDeque<bool>,
    streak: i32,
    last_adjust_tick: u64,
}

impl Default for AdaptiveController {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveController {
    pub fn new() -> Self {
        Self { outcomes: VecDeque::new(), streak: 0, last_adjust_tick: 0 }
    }

    /// Record one closed trade. The streak counts consecutive wins above
    /// zero and consecutive losses below; a loss resets a winning run.
    pub fn record(&mut self, pnl: f64, window: usize) {
        self.outcomes.push_back(pnl > 0.0);
        while self.outcomes.len() > window.max(1) {
            self.outcomes.pop_front();
        }
        self.streak = if pnl > 0.0 {
            self.streak.max(0) + 1
        } else {
            self.streak.min(0) - 1
        };
    }

    pub fn win_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let wins = self.outcomes.iter().filter(|w| **w).count();
        Some(wins as f64 / self.outcomes.len() as f64)
    }

    pub fn streak(&self) -> i32 {
        self.streak
    }

    /// Confidence multiplier for cap scaling, centered at 1.0 and bounded.
    pub fn confidence(&self) -> f64 {
        let rate = self.win_rate().unwrap_or(0.5);
        let streak_lean = 0.05 * self.streak.clamp(-4, 4) as f64;
        (1.0 + (rate - 0.5) + streak_lean).clamp(0.5, 1.5)
    }

    /// Nudge thresholds if the cadence and sample-size requirements are met.
    /// Returns what was done for logging.
    pub fn maybe_adjust(&mut self, tick: u64, cfg: &mut StrategyConfig) -> Option<Adjustment> {
        if tick.saturating_sub(self.last_adjust_tick) < cfg.adapt_every_ticks {
            return None;
        }
        if self.outcomes.len() < cfg.adapt_min_trades {
            return None;
        }
        let rate = self.win_rate()?;
        let loosened = if rate > cfg.win_rate_upper {
            cfg.buy_long_forecast -= cfg.forecast_step;
            cfg.per_instrument_cap += cfg.cap_step;
            cfg.er_entry -= cfg.er_step;
            true
        } else if rate < cfg.win_rate_lower {
            cfg.buy_long_forecast += cfg.forecast_step;
            cfg.per_instrument_cap -= cfg.cap_step;
            cfg.er_entry += cfg.er_step;
            false
        } else {
            return None;
        };
        cfg.buy_long_forecast = cfg
            .buy_long_forecast
            .clamp(cfg.buy_forecast_min, cfg.buy_forecast_max);
        cfg.per_instrument_cap = cfg.per_instrument_cap.clamp(cfg.cap_min, cfg.cap_max);
        cfg.er_entry = cfg.er_entry.clamp(cfg.er_entry_min, cfg.er_entry_max);
        self.last_adjust_tick = tick;
        Some(Adjustment { win_rate: rate, loosened })
    }
}

// =============================================================================
// Tests
// =============================================================================
