//! Risk controller: pre-buy gates and per-position exit rules.
//!
//! Gates can suppress an entire buy phase; exits are never suppressed and
//! are evaluated for every held position on every tick.

use crate::market::Side;
use crate::state::{Instrument, PortfolioState, StrategyConfig};

// =============================================================================
// Pre-buy gates
// =============================================================================

/// Outcome of the ordered pre-buy gate chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BuyGate {
    /// All gates passed; `spendable` is the budget for this tick's entries.
    Clear { spendable: f64 },
    /// Worth fell too far below the session peak.
    DrawdownHalt,
    /// No instrument has shown a signal above the floor for too long.
    FlatMarket,
    /// Reserve and deployment limits leave nothing worth ordering.
    NoBudget,
}

impl BuyGate {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuyGate::Clear { .. } => "clear",
            BuyGate::DrawdownHalt => "drawdown_halt",
            BuyGate::FlatMarket => "flat_market",
            BuyGate::NoBudget => "no_budget",
        }
    }
}

pub struct RiskController {
    flat_ticks: u32,
}

impl Default for RiskController {
    fn default() -> Self {
        Self::new()
    }
}

impl RiskController {
    pub fn new() -> Self {
        Self { flat_ticks: 0 }
    }

    /// Evaluate the pre-buy gates in their fixed order. `invested` is the
    /// current liquidation value of all open positions, `max_abs_er` the
    /// strongest |expected return| across instruments this tick.
    pub fn pre_buy(
        &mut self,
        cfg: &StrategyConfig,
        portfolio: &mut PortfolioState,
        worth: f64,
        invested: f64,
        max_abs_er: f64,
    ) -> BuyGate {
        portfolio.note_worth(worth);
        if worth < portfolio.peak_worth * (1.0 - cfg.drawdown_halt) {
            return BuyGate::DrawdownHalt;
        }

        if max_abs_er < cfg.flat_er_floor {
            self.flat_ticks = self.flat_ticks.saturating_add(1);
        } else {
            self.flat_ticks = 0;
        }
        if self.flat_ticks >= cfg.flat_ticks_limit {
            return BuyGate::FlatMarket;
        }

        let spendable = (portfolio.cash - cfg.reserve_cash)
            .min(worth * cfg.max_deploy_fraction - invested);
        if spendable < cfg.min_order_value {
            return BuyGate::NoBudget;
        }
        BuyGate::Clear { spendable }
    }

    pub fn flat_ticks(&self) -> u32 {
        self.flat_ticks
    }
}

// =============================================================================
// Exit rules
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Forecast crossed the configured sell threshold
    Threshold,
    /// Threshold crossed only because the suspected-flip offset tightened it
    LeadingFlip,
    /// Expected return crossed zero (with buffer on estimated data)
    ReturnDecay,
    /// Confirmed regime flip
    FlipConfirmed,
    /// Position outlived a full estimation cycle with a neutral forecast
    Stale,
    /// Early profit lock
    ProfitLock,
}

impl ExitReason {
    pub fn tag(&self) -> &'static str {
        match self {
            ExitReason::Threshold => "forecast",
            ExitReason::LeadingFlip => "early",
            ExitReason::ReturnDecay => "er",
            ExitReason::FlipConfirmed => "flip",
            ExitReason::Stale => "stale",
            ExitReason::ProfitLock => "lock",
        }
    }
}

/// Evaluate every exit rule for one held side of one instrument. Returns the
/// first matching reason: standard rules, then stale, then profit lock.
/// `using_estimates` widens the expected-return exit with a buffer since
/// estimated signals are noisier around zero.
pub fn evaluate_exit(
    cfg: &StrategyConfig,
    inst: &Instrument,
    side: Side,
    price: f64,
    tick: u64,
    using_estimates: bool,
) -> Option<ExitReason> {
    if inst.qty(side) <= 0.0 {
        return None;
    }
    let forecast = inst.forecast();
    let er = inst.expected_return;

    if inst.flip.confirmed() {
        return Some(ExitReason::FlipConfirmed);
    }

    let offset = if inst.flip.early() { cfg.early_exit_offset } else { 0.0 };
    match side {
        Side::Long => {
            let base = cfg.sell_long_forecast;
            if forecast < base {
                return Some(ExitReason::Threshold);
            }
            if forecast < base + offset {
                return Some(ExitReason::LeadingFlip);
            }
        }
        Side::Short => {
            let base = cfg.sell_short_forecast();
            if forecast > base {
                return Some(ExitReason::Threshold);
            }
            if forecast > base - offset {
                return Some(ExitReason::LeadingFlip);
            }
        }
    }

    let buffer = if using_estimates { cfg.er_exit_buffer } else { 0.0 };
    let decayed = match side {
        Side::Long => er < buffer,
        Side::Short => er > -buffer,
    };
    if decayed {
        return Some(ExitReason::ReturnDecay);
    }

    let age = inst.position_age(tick);
    if age > cfg.stale_exit_ticks && (forecast - 0.5).abs() < cfg.neutral_band {
        return Some(ExitReason::Stale);
    }

    if age >= cfg.early_lock_min_ticks {
        let entry = inst.avg_entry(side);
        if entry > 0.0 {
            let unrealized = match side {
                Side::Long => (price - entry) / entry,
                Side::Short => (entry - price) / entry,
            };
            if unrealized >= cfg.early_lock_return {
                return Some(ExitReason::ProfitLock);
            }
        }
    }

    None
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::PositionSnapshot;

    fn cfg() -> StrategyConfig {
        StrategyConfig::default()
    }

    fn long_inst(forecast: f64, er: f64) -> Instrument {
        let mut i = Instrument::new("ABC", 10);
        i.est_forecast = forecast;
        i.est_volatility = 0.02;
        i.expected_return = er;
        i.apply_position(
            PositionSnapshot { long_qty: 10.0, long_avg: 100.0, ..Default::default() },
            1,
        );
        i
    }

    // -------------------------------------------------------------------------
    // Pre-buy gates
    // -------------------------------------------------------------------------

    #[test]
    fn drawdown_halt_blocks_buying() {
        let cfg = cfg();
        let mut risk = RiskController::new();
        let mut p = PortfolioState::new(100_000.0);
        p.note_worth(200_000.0);

        // Worth 170k < 200k * 0.9 -> halted.
        let gate = risk.pre_buy(&cfg, &mut p, 170_000.0, 0.0, 0.01);
        assert_eq!(gate, BuyGate::DrawdownHalt);

        // Recovery above the halt line clears it.
        let gate = risk.pre_buy(&cfg, &mut p, 195_000.0, 0.0, 0.01);
        assert!(matches!(gate, BuyGate::Clear { .. }));
    }

    #[test]
    fn peak_updates_before_halt_check() {
        let cfg = cfg();
        let mut risk = RiskController::new();
        let mut p = PortfolioState::new(100_000.0);
        // A new high can never be a drawdown.
        let gate = risk.pre_buy(&cfg, &mut p, 300_000.0, 0.0, 0.01);
        assert!(matches!(gate, BuyGate::Clear { .. }));
        assert_eq!(p.peak_worth, 300_000.0);
    }

    #[test]
    fn flat_market_skip_after_consecutive_quiet_ticks() {
        let mut cfg = cfg();
        cfg.flat_ticks_limit = 3;
        let mut risk = RiskController::new();
        let mut p = PortfolioState::new(1_000_000.0);

        for _ in 0..2 {
            let gate = risk.pre_buy(&cfg, &mut p, 1_000_000.0, 0.0, 0.0001);
            assert!(matches!(gate, BuyGate::Clear { .. }));
        }
        let gate = risk.pre_buy(&cfg, &mut p, 1_000_000.0, 0.0, 0.0001);
        assert_eq!(gate, BuyGate::FlatMarket);

        // One loud tick resets the counter to zero.
        let gate = risk.pre_buy(&cfg, &mut p, 1_000_000.0, 0.0, 0.01);
        assert!(matches!(gate, BuyGate::Clear { .. }));
        assert_eq!(risk.flat_ticks(), 0);
    }

    #[test]
    fn spendable_respects_reserve_and_deployment() {
        let mut cfg = cfg();
        cfg.reserve_cash = 40_000.0;
        cfg.max_deploy_fraction = 0.5;
        cfg.min_order_value = 1_000.0;
        let mut risk = RiskController::new();
        let mut p = PortfolioState::new(100_000.0);

        // Worth 100k, nothing invested: deploy limit allows 50k, reserve
        // allows 60k -> spendable 50k.
        match risk.pre_buy(&cfg, &mut p, 100_000.0, 0.0, 0.01) {
            BuyGate::Clear { spendable } => assert!((spendable - 50_000.0).abs() < 1e-6),
            other => panic!("unexpected gate {:?}", other),
        }

        // Almost fully deployed: 48k invested leaves 2k under the deploy cap.
        p.cash = 52_000.0;
        match risk.pre_buy(&cfg, &mut p, 100_000.0, 48_000.0, 0.01) {
            BuyGate::Clear { spendable } => assert!((spendable - 2_000.0).abs() < 1e-6),
            other => panic!("unexpected gate {:?}", other),
        }

        // Below the minimum order value the phase is skipped entirely.
        p.cash = 40_500.0;
        let gate = risk.pre_buy(&cfg, &mut p, 100_000.0, 49_900.0, 0.01);
        assert_eq!(gate, BuyGate::NoBudget);
    }

    // -------------------------------------------------------------------------
    // Exit rules
    // -------------------------------------------------------------------------

    #[test]
    fn forecast_threshold_exit() {
        let cfg = cfg();
        let inst = long_inst(0.45, 0.001);
        assert_eq!(
            evaluate_exit(&cfg, &inst, Side::Long, 100.0, 5, true),
            Some(ExitReason::Threshold)
        );
    }

    #[test]
    fn healthy_long_does_not_exit() {
        let cfg = cfg();
        let inst = long_inst(0.65, 0.003);
        assert_eq!(evaluate_exit(&cfg, &inst, Side::Long, 100.0, 5, true), None);
    }

    #[test]
    fn flat_side_is_ignored() {
        let cfg = cfg();
        let inst = long_inst(0.1, -0.01);
        assert_eq!(evaluate_exit(&cfg, &inst, Side::Short, 100.0, 5, true), None);
    }

    #[test]
    fn expected_return_decay_exit_with_buffer() {
        let cfg = cfg();
        // Forecast still above the sell threshold, but the edge is inside
        // the estimated-data buffer.
        let inst = long_inst(0.55, 0.0001);
        assert_eq!(
            evaluate_exit(&cfg, &inst, Side::Long, 100.0, 5, true),
            Some(ExitReason::ReturnDecay)
        );
        // With authoritative data there is no buffer, so it holds.
        assert_eq!(evaluate_exit(&cfg, &inst, Side::Long, 100.0, 5, false), None);
    }

    #[test]
    fn confirmed_flip_forces_exit() {
        let cfg = cfg();
        let mut inst = long_inst(0.7, 0.004);
        inst.flip.observe(true, 4);
        inst.flip.observe(true, 5);
        assert_eq!(
            evaluate_exit(&cfg, &inst, Side::Long, 100.0, 5, true),
            Some(ExitReason::FlipConfirmed)
        );
    }

    #[test]
    fn suspected_flip_tightens_threshold() {
        let cfg = cfg();
        // Forecast sits just above the base sell threshold; the suspect
        // offset pushes the effective threshold over it.
        let mut inst = long_inst(0.51, 0.004);
        inst.flip.observe(true, 5);
        assert_eq!(
            evaluate_exit(&cfg, &inst, Side::Long, 100.0, 5, false),
            Some(ExitReason::LeadingFlip)
        );
        // Without the suspicion the same forecast holds.
        let inst2 = long_inst(0.51, 0.004);
        assert_eq!(evaluate_exit(&cfg, &inst2, Side::Long, 100.0, 5, false), None);
    }

    #[test]
    fn stale_position_with_neutral_forecast_closes() {
        let mut cfg = cfg();
        cfg.stale_exit_ticks = 10;
        let mut inst = long_inst(0.52, 0.002);
        inst.opened_tick = 1;
        assert_eq!(
            evaluate_exit(&cfg, &inst, Side::Long, 100.0, 12, false),
            Some(ExitReason::Stale)
        );
        // Same age with a decisive forecast is not stale.
        let mut inst2 = long_inst(0.62, 0.004);
        inst2.opened_tick = 1;
        assert_eq!(evaluate_exit(&cfg, &inst2, Side::Long, 100.0, 12, false), None);
    }

    #[test]
    fn profit_lock_overrides_waiting_for_signal() {
        let mut cfg = cfg();
        cfg.early_lock_min_ticks = 5;
        cfg.early_lock_return = 0.1;
        let mut inst = long_inst(0.7, 0.004);
        inst.opened_tick = 1;
        // +12% unrealized after the minimum age.
        assert_eq!(
            evaluate_exit(&cfg, &inst, Side::Long, 112.0, 7, false),
            Some(ExitReason::ProfitLock)
        );
        // Too young: keeps riding.
        assert_eq!(evaluate_exit(&cfg, &inst, Side::Long, 112.0, 3, false), None);
    }

    #[test]
    fn short_side_thresholds_mirror() {
        let cfg = cfg();
        let mut inst = Instrument::new("ABC", 10);
        inst.est_forecast = 0.55; // above 1 - 0.5 = 0.5 -> short must exit
        inst.est_volatility = 0.02;
        inst.expected_return = 0.001;
        inst.apply_position(
            PositionSnapshot { short_qty: 10.0, short_avg: 100.0, ..Default::default() },
            1,
        );
        assert_eq!(
            evaluate_exit(&cfg, &inst, Side::Short, 100.0, 5, true),
            Some(ExitReason::Threshold)
        );
    }
}
