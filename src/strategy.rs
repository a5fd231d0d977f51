//! Strategy policies and per-tick routing state.
//!
//! One policy is chosen at process start and stays fixed for the run. It
//! selects the sizing variant and threshold preset; the estimator, flip
//! detector and return model are shared by every policy. The single-bet
//! policy carries its own Idle -> Holding -> Cooldown machine keyed on
//! wall-clock time.

use crate::sizing::SizerKind;
use crate::state::StrategyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Best-signal-first entries at the default thresholds
    Ranked,
    /// Edge/risk proportional budgets
    Kelly,
    /// Few, large, high-conviction positions
    Sniper,
    /// Many small positions at a permissive threshold
    Spray,
    /// One position at a time with a loss cooldown
    SingleBet,
}

impl Policy {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("POLICY").unwrap_or_default())
    }

    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "kelly" => Policy::Kelly,
            "sniper" => Policy::Sniper,
            "spray" => Policy::Spray,
            "single_bet" | "single" => Policy::SingleBet,
            _ => Policy::Ranked,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Ranked => "ranked",
            Policy::Kelly => "kelly",
            Policy::Sniper => "sniper",
            Policy::Spray => "spray",
            Policy::SingleBet => "single_bet",
        }
    }

    pub fn sizer(&self) -> SizerKind {
        match self {
            Policy::Ranked => SizerKind::Ranked,
            Policy::Kelly => SizerKind::Kelly,
            Policy::Sniper | Policy::SingleBet => SizerKind::Concentrated,
            Policy::Spray => SizerKind::Diversified,
        }
    }

    /// Overlay the policy's threshold preset on a base config.
    pub fn apply_preset(&self, cfg: &mut StrategyConfig) {
        match self {
            Policy::Ranked | Policy::Kelly => {}
            Policy::Sniper => {
                cfg.max_positions = 3;
                cfg.per_instrument_cap = 0.45;
                cfg.er_entry *= 1.5;
            }
            Policy::Spray => {
                cfg.max_positions = 10;
                cfg.per_instrument_cap = 0.12;
                cfg.er_entry *= 0.5;
            }
            Policy::SingleBet => {
                cfg.max_positions = 1;
                cfg.per_instrument_cap = 0.3;
            }
        }
    }

    /// Whether candidates must show authoritative/estimated forecast
    /// agreement with a margin before entry.
    pub fn requires_conviction(&self) -> bool {
        matches!(self, Policy::Sniper)
    }
}

// =============================================================================
// Single-bet state machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetState {
    Idle,
    Holding,
    /// No new bet until the wall clock passes the deadline
    Cooldown { until_ms: u64 },
}

// =============================================================================
// Router
// =============================================================================

pub struct StrategyRouter {
    pub policy: Policy,
    bet: BetState,
}

impl StrategyRouter {
    pub fn new(policy: Policy) -> Self {
        Self { policy, bet: BetState::Idle }
    }

    pub fn bet_state(&self) -> BetState {
        self.bet
    }

    /// Gate the buy phase. Only the single-bet policy ever refuses; other
    /// policies rely on the risk controller and sizer limits.
    pub fn entry_allowed(&mut self, now_ms: u64, has_any_exposure: bool) -> bool {
        if self.policy != Policy::SingleBet {
            return true;
        }
        match self.bet {
            BetState::Idle => !has_any_exposure,
            BetState::Holding => false,
            BetState::Cooldown { until_ms } => {
                if now_ms >= until_ms {
                    self.bet = BetState::Idle;
                    !has_any_exposure
                } else {
                    false
                }
            }
        }
    }

    /// The forecast conviction an entry must clear under this policy.
    pub fn entry_forecast(&self, cfg: &StrategyConfig) -> f64 {
        match self.policy {
            Policy::SingleBet => cfg.single_bet_forecast.max(cfg.buy_long_forecast),
            _ => cfg.buy_long_forecast,
        }
    }

    pub fn note_entry(&mut self) {
        if self.policy == Policy::SingleBet {
            self.bet = BetState::Holding;
        }
    }

    /// A losing exit routes through cooldown; a winning one frees the slot
    /// immediately.
    pub fn note_exit(&mut self, pnl: f64, now_ms: u64, cfg: &StrategyConfig) {
        if self.policy != Policy::SingleBet {
            return;
        }
        self.bet = if pnl < 0.0 {
            BetState::Cooldown { until_ms: now_ms.saturating_add(cfg.cooldown_ms) }
        } else {
            BetState::Idle
        };
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_lenient() {
        assert_eq!(Policy::parse("kelly"), Policy::Kelly);
        assert_eq!(Policy::parse("SNIPER"), Policy::Sniper);
        assert_eq!(Policy::parse("single"), Policy::SingleBet);
        assert_eq!(Policy::parse("anything-else"), Policy::Ranked);
    }

    #[test]
    fn presets_shape_concurrency_and_caps() {
        let mut sniper = StrategyConfig::default();
        Policy::Sniper.apply_preset(&mut sniper);
        assert_eq!(sniper.max_positions, 3);
        assert!((sniper.per_instrument_cap - 0.45).abs() < 1e-12);

        let mut spray = StrategyConfig::default();
        Policy::Spray.apply_preset(&mut spray);
        assert_eq!(spray.max_positions, 10);
        assert!(spray.er_entry < StrategyConfig::default().er_entry);
    }

    #[test]
    fn non_single_policies_always_allow_entry() {
        let mut r = StrategyRouter::new(Policy::Ranked);
        assert!(r.entry_allowed(0, true));
        assert!(r.entry_allowed(0, false));
    }

    #[test]
    fn single_bet_blocks_while_holding() {
        let cfg = StrategyConfig::default();
        let mut r = StrategyRouter::new(Policy::SingleBet);
        assert!(r.entry_allowed(1_000, false));
        r.note_entry();
        assert_eq!(r.bet_state(), BetState::Holding);
        assert!(!r.entry_allowed(2_000, true));
        // A winning exit frees the slot at once.
        r.note_exit(50.0, 3_000, &cfg);
        assert_eq!(r.bet_state(), BetState::Idle);
        assert!(r.entry_allowed(3_000, false));
    }

    #[test]
    fn losing_exit_enters_cooldown_until_deadline() {
        let cfg = StrategyConfig { cooldown_ms: 10_000, ..Default::default() };
        let mut r = StrategyRouter::new(Policy::SingleBet);
        r.note_entry();
        r.note_exit(-25.0, 100_000, &cfg);
        assert_eq!(r.bet_state(), BetState::Cooldown { until_ms: 110_000 });

        assert!(!r.entry_allowed(105_000, false));
        assert!(!r.entry_allowed(109_999, false));
        // Deadline passed: the machine returns to Idle and admits entries.
        assert!(r.entry_allowed(110_000, false));
        assert_eq!(r.bet_state(), BetState::Idle);
    }

    #[test]
    fn idle_refuses_while_exposure_lingers() {
        // Residual exposure (e.g. position not yet resynced away) blocks a
        // fresh bet even in Idle.
        let mut r = StrategyRouter::new(Policy::SingleBet);
        assert!(!r.entry_allowed(0, true));
    }

    #[test]
    fn single_bet_demands_higher_conviction() {
        let cfg = StrategyConfig::default();
        let single = StrategyRouter::new(Policy::SingleBet);
        let ranked = StrategyRouter::new(Policy::Ranked);
        assert!(single.entry_forecast(&cfg) > ranked.entry_forecast(&cfg));
    }
}
