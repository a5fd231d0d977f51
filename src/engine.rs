//! The tick loop.
//!
//! One engine instance owns one session and one policy for the process
//! lifetime. Each tick: resync cash/positions from the feed, push prices,
//! re-estimate, update flip detectors, recompute expected returns, run the
//! sell phase, then the buy phase (capital freed by an exit is spendable the
//! same tick), then adaptive adjustments on their own cadence. Every
//! collaborator failure degrades to "no action this tick"; the only blocking
//! condition is missing basic market access at startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::timeout;

use crate::adaptive::AdaptiveController;
use crate::estimator::{calc_momentum, estimate, estimate_volatility};
use crate::logging::{obj, v_num, v_str, Domain, EventLog, Level};
use crate::market::{MarketFeed, Side};
use crate::risk::{evaluate_exit, BuyGate, RiskController};
use crate::signals::expected_return;
use crate::sizing::{allocate, order_qty, Candidate};
use crate::state::{Instrument, Session, StrategyConfig, TradeRecord};
use crate::strategy::{Policy, StrategyRouter};

pub struct Engine {
    feed: Arc<dyn MarketFeed>,
    log: Arc<dyn EventLog>,
    cfg: StrategyConfig,
    router: StrategyRouter,
    risk: RiskController,
    adaptive: AdaptiveController,
    session: Session,
    /// Cached capability flags; downgrade-only for the session
    auth_data: bool,
    short_support: bool,
}

impl Engine {
    pub fn new(
        feed: Arc<dyn MarketFeed>,
        log: Arc<dyn EventLog>,
        mut cfg: StrategyConfig,
        policy: Policy,
    ) -> Result<Self> {
        policy.apply_preset(&mut cfg);
        let symbols = feed.symbols();
        let starting_cash = feed.cash()?;
        let session = Session::new(symbols, starting_cash, cfg.history_capacity);
        let auth_data = feed.has_authoritative_data();
        let short_support = feed.has_short_support();
        log.emit(
            Level::Info,
            Domain::System,
            "engine_start",
            obj(&[
                ("policy", v_str(policy.as_str())),
                ("instruments", v_num(session.instruments.len() as f64)),
                ("starting_cash", v_num(starting_cash)),
                ("authoritative_data", serde_json::json!(auth_data)),
                ("short_support", serde_json::json!(short_support)),
            ]),
        );
        Ok(Self {
            feed,
            log,
            cfg,
            router: StrategyRouter::new(policy),
            risk: RiskController::new(),
            adaptive: AdaptiveController::new(),
            session,
            auth_data,
            short_support,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.cfg
    }

    pub fn auth_active(&self) -> bool {
        self.auth_data
    }

    pub fn shorts_active(&self) -> bool {
        self.short_support
    }

    /// Run until externally stopped.
    pub async fn run(&mut self) -> Result<()> {
        while !self.feed.has_basic_access() {
            self.log.emit(
                Level::Warn,
                Domain::System,
                "awaiting_market_access",
                obj(&[("tick", v_num(self.session.tick as f64))]),
            );
            self.wait_for_tick().await;
        }
        loop {
            let now_ms = Utc::now().timestamp_millis() as u64;
            if let Err(err) = self.tick(now_ms) {
                self.log.emit(
                    Level::Error,
                    Domain::System,
                    "tick_failed",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
            }
            self.wait_for_tick().await;
        }
    }

    /// Tick wait with a bounded fallback so a stalled event source cannot
    /// block the loop.
    async fn wait_for_tick(&self) {
        let fallback = Duration::from_millis(self.cfg.tick_fallback_ms.max(1));
        let _ = timeout(fallback, self.feed.next_tick()).await;
    }

    /// One decision cycle. `now_ms` is wall-clock milliseconds, injected so
    /// the single-bet cooldown is testable against a mock clock.
    pub fn tick(&mut self, now_ms: u64) -> Result<()> {
        self.session.tick += 1;
        self.refresh();
        let closed = self.sell_phase();
        for rec in closed {
            self.adaptive.record(rec.pnl, self.cfg.adapt_window);
            self.router.note_exit(rec.pnl, now_ms, &self.cfg);
            self.log.trade(obj(&[
                ("symbol", v_str(&rec.symbol)),
                ("side", v_str(rec.side.as_str())),
                ("qty", v_num(rec.qty)),
                ("entry_price", v_num(rec.entry_price)),
                ("exit_price", v_num(rec.exit_price)),
                ("pnl", v_num(rec.pnl)),
                ("tick", v_num(rec.tick_closed as f64)),
                ("tag", v_str(rec.tag)),
            ]));
            self.session.record_trade(rec);
        }
        self.buy_phase(now_ms);

        if self.cfg.adaptive {
            if let Some(adj) = self.adaptive.maybe_adjust(self.session.tick, &mut self.cfg) {
                self.log.emit(
                    Level::Info,
                    Domain::Adaptive,
                    "thresholds_adjusted",
                    obj(&[
                        ("win_rate", v_num(adj.win_rate)),
                        ("direction", v_str(if adj.loosened { "loosen" } else { "tighten" })),
                        ("buy_forecast", v_num(self.cfg.buy_long_forecast)),
                        ("per_instrument_cap", v_num(self.cfg.per_instrument_cap)),
                        ("er_entry", v_num(self.cfg.er_entry)),
                    ]),
                );
            }
        }

        if self.cfg.snapshot_every_ticks > 0
            && self.session.tick % self.cfg.snapshot_every_ticks == 0
        {
            self.emit_snapshot();
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Per-tick state refresh
    // -------------------------------------------------------------------------

    fn refresh(&mut self) {
        let tick = self.session.tick;
        match self.feed.cash() {
            Ok(c) => self.session.portfolio.cash = c,
            Err(err) => self.log.emit(
                Level::Warn,
                Domain::Market,
                "cash_read_failed",
                obj(&[("error", v_str(&err.to_string()))]),
            ),
        }

        let mut lost_auth = false;
        for inst in self.session.instruments.iter_mut() {
            match self.feed.position(&inst.symbol) {
                Ok(snap) => inst.apply_position(snap, tick),
                Err(err) => {
                    // Transient: stale position state would poison every
                    // downstream decision, so skip the instrument this tick.
                    self.log.emit(
                        Level::Warn,
                        Domain::Market,
                        "position_resync_failed",
                        obj(&[
                            ("symbol", v_str(&inst.symbol)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                    continue;
                }
            }
            match self.feed.price(&inst.symbol) {
                Ok(p) if p > 0.0 => inst.history.push(p),
                Ok(_) => {}
                Err(err) => {
                    self.log.emit(
                        Level::Warn,
                        Domain::Market,
                        "price_read_failed",
                        obj(&[
                            ("symbol", v_str(&inst.symbol)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                    continue;
                }
            }

            let prices = inst.history.as_slice();
            let est = estimate(
                prices,
                self.cfg.long_window,
                self.cfg.short_window,
                self.cfg.inversion_delta,
            );
            inst.est_forecast = est.forecast;
            inst.est_forecast_short = est.forecast_short;
            inst.est_volatility = estimate_volatility(prices);
            inst.momentum = calc_momentum(prices);

            if self.auth_data {
                match (self.feed.forecast(&inst.symbol), self.feed.volatility(&inst.symbol)) {
                    (Ok(f), Ok(v)) => {
                        inst.auth_forecast = Some(f.clamp(0.0, 1.0));
                        inst.auth_volatility = Some(v.max(0.0));
                    }
                    _ => lost_auth = true,
                }
            }

            inst.flip.observe(est.inversion_raw, tick);
            inst.expected_return = expected_return(inst, self.cfg.blend_signals);
            inst.ticks_since_action = inst.ticks_since_action.saturating_add(1);

            self.log.emit(
                Level::Trace,
                Domain::Market,
                "signal",
                obj(&[
                    ("symbol", v_str(&inst.symbol)),
                    ("forecast", v_num(inst.forecast())),
                    ("forecast_short", v_num(inst.est_forecast_short)),
                    ("volatility", v_num(inst.volatility())),
                    ("momentum", v_num(inst.momentum)),
                    ("expected_return", v_num(inst.expected_return)),
                    ("flip", v_str(&format!("{:?}", inst.flip.state()))),
                ]),
            );
        }

        if lost_auth {
            // Capability loss is permanent for the session; drop every
            // cached authoritative value and fall back to estimates.
            self.auth_data = false;
            for inst in self.session.instruments.iter_mut() {
                inst.auth_forecast = None;
                inst.auth_volatility = None;
                inst.expected_return = expected_return(inst, self.cfg.blend_signals);
            }
            self.log.emit(
                Level::Warn,
                Domain::System,
                "authoritative_data_downgraded",
                obj(&[("tick", v_num(tick as f64))]),
            );
        }
    }

    /// Liquidation value of all open positions, quoted by the collaborator.
    fn invested_value(&self) -> f64 {
        self.session
            .instruments
            .iter()
            .map(|inst| {
                let mut value = 0.0;
                if inst.long_qty > 0.0 {
                    value += self
                        .feed
                        .sale_gain(&inst.symbol, inst.long_qty, Side::Long)
                        .unwrap_or_else(|_| {
                            inst.long_qty * inst.history.last().unwrap_or(inst.long_avg)
                        });
                }
                if inst.short_qty > 0.0 {
                    value += self
                        .feed
                        .sale_gain(&inst.symbol, inst.short_qty, Side::Short)
                        .unwrap_or_else(|_| inst.short_qty * inst.short_avg);
                }
                value
            })
            .sum()
    }

    // -------------------------------------------------------------------------
    // Sell phase
    // -------------------------------------------------------------------------

    fn sell_phase(&mut self) -> Vec<TradeRecord> {
        let tick = self.session.tick;
        let using_estimates = !self.auth_data;
        let mut closed = Vec::new();

        for idx in 0..self.session.instruments.len() {
            for side in [Side::Long, Side::Short] {
                let inst = &self.session.instruments[idx];
                if inst.qty(side) <= 0.0 {
                    continue;
                }
                let price = match inst.history.last() {
                    Some(p) => p,
                    None => continue,
                };
                let reason =
                    match evaluate_exit(&self.cfg, inst, side, price, tick, using_estimates) {
                        Some(r) => r,
                        None => continue,
                    };
                let qty = inst.qty(side);
                let entry_price = inst.avg_entry(side);
                let symbol = inst.symbol.clone();

                // Proceeds come from the collaborator's quote, never from
                // price * qty: the quote already reflects spread+commission.
                let gain = match self.feed.sale_gain(&symbol, qty, side) {
                    Ok(g) => g,
                    Err(err) => {
                        self.log.emit(
                            Level::Warn,
                            Domain::Exec,
                            "sale_quote_failed",
                            obj(&[
                                ("symbol", v_str(&symbol)),
                                ("error", v_str(&err.to_string())),
                            ]),
                        );
                        continue;
                    }
                };
                let submitted = match side {
                    Side::Long => self.feed.sell_long(&symbol, qty),
                    Side::Short => self.feed.sell_short(&symbol, qty),
                };
                match submitted {
                    Ok(exit_price) => {
                        let pnl = gain - qty * entry_price;
                        self.log.emit(
                            Level::Info,
                            Domain::Exec,
                            "exit",
                            obj(&[
                                ("symbol", v_str(&symbol)),
                                ("side", v_str(side.as_str())),
                                ("qty", v_num(qty)),
                                ("proceeds", v_num(gain)),
                                ("reason", v_str(reason.tag())),
                            ]),
                        );
                        let inst = &mut self.session.instruments[idx];
                        inst.ticks_since_action = 0;
                        closed.push(TradeRecord {
                            symbol,
                            side,
                            qty,
                            entry_price,
                            exit_price,
                            pnl,
                            tick_closed: tick,
                            tag: reason.tag(),
                        });
                    }
                    Err(err) => {
                        // Fire-and-confirm: a rejected order is no state
                        // change, retried naturally next tick.
                        self.log.emit(
                            Level::Warn,
                            Domain::Exec,
                            "exit_order_failed",
                            obj(&[
                                ("symbol", v_str(&symbol)),
                                ("error", v_str(&err.to_string())),
                            ]),
                        );
                    }
                }
            }
        }
        closed
    }

    // -------------------------------------------------------------------------
    // Buy phase
    // -------------------------------------------------------------------------

    fn buy_phase(&mut self, now_ms: u64) {
        let tick = self.session.tick;
        // Re-read cash so capital freed by this tick's exits is spendable.
        if let Ok(c) = self.feed.cash() {
            self.session.portfolio.cash = c;
        }
        let invested = self.invested_value();
        let worth = self.session.portfolio.cash + invested;
        let max_abs_er = self
            .session
            .instruments
            .iter()
            .map(|i| i.expected_return.abs())
            .fold(0.0, f64::max);

        let gate =
            self.risk
                .pre_buy(&self.cfg, &mut self.session.portfolio, worth, invested, max_abs_er);
        let mut spendable = match gate {
            BuyGate::Clear { spendable } => spendable,
            blocked => {
                self.log.emit(
                    Level::Debug,
                    Domain::Risk,
                    "buy_phase_skipped",
                    obj(&[("gate", v_str(blocked.as_str())), ("tick", v_num(tick as f64))]),
                );
                return;
            }
        };

        let has_exposure = self.session.instruments.iter().any(|i| i.has_position());
        if !self.router.entry_allowed(now_ms, has_exposure) {
            self.log.emit(
                Level::Debug,
                Domain::Strategy,
                "entry_blocked",
                obj(&[("state", v_str(match self.router.bet_state() {
                    crate::strategy::BetState::Idle => "idle",
                    crate::strategy::BetState::Holding => "holding",
                    crate::strategy::BetState::Cooldown { .. } => "cooldown",
                }))]),
            );
            return;
        }

        let entry_forecast = self.router.entry_forecast(&self.cfg);
        let cap_fraction = if self.cfg.confidence_scaled {
            self.cfg.per_instrument_cap * self.adaptive.confidence()
        } else {
            self.cfg.per_instrument_cap
        };
        let cap_value = worth * cap_fraction;

        let mut candidates = Vec::new();
        for (i, inst) in self.session.instruments.iter().enumerate() {
            let er = inst.expected_return;
            if er.abs() < self.cfg.er_entry {
                continue;
            }
            if inst.flip.confirmed() {
                continue;
            }
            let forecast = inst.forecast();
            let side = if er > 0.0 { Side::Long } else { Side::Short };
            match side {
                Side::Long => {
                    if forecast < entry_forecast {
                        continue;
                    }
                }
                Side::Short => {
                    if !self.short_support || forecast > 1.0 - entry_forecast {
                        continue;
                    }
                }
            }
            if self.router.policy.requires_conviction()
                && !conviction_agrees(inst, self.cfg.conviction_margin)
            {
                continue;
            }
            let quoted = match side {
                Side::Long => self.feed.ask_price(&inst.symbol),
                Side::Short => self.feed.bid_price(&inst.symbol),
            };
            let price = match quoted {
                Ok(p) if p > 0.0 => p,
                _ => continue,
            };
            let exposure = self.instrument_exposure(inst);
            candidates.push(Candidate {
                index: i,
                side,
                er,
                volatility: inst.volatility(),
                price,
                exposure,
            });
        }

        let open_positions = self.session.open_position_count();
        let allocations = allocate(
            self.router.policy.sizer(),
            &candidates,
            spendable,
            cap_value,
            self.cfg.min_order_value,
            self.cfg.max_positions,
            open_positions,
        );

        for alloc in allocations {
            if spendable < self.cfg.min_order_value {
                break;
            }
            let budget = alloc.budget.min(spendable);
            let share_capacity = ((cap_value - alloc.exposure).max(0.0) / alloc.price).floor();
            let qty = order_qty(budget, alloc.price, self.feed.commission(), share_capacity);
            if qty < 1.0 {
                continue;
            }
            let symbol = self.session.instruments[alloc.index].symbol.clone();
            let cost = match self.feed.purchase_cost(&symbol, qty, alloc.side) {
                Ok(c) => c,
                Err(err) => {
                    self.log.emit(
                        Level::Warn,
                        Domain::Exec,
                        "cost_quote_failed",
                        obj(&[("symbol", v_str(&symbol)), ("error", v_str(&err.to_string()))]),
                    );
                    continue;
                }
            };
            if cost > budget || cost > spendable {
                // A stale quote pushed the cost over budget: never submit a
                // partial fill, just skip.
                self.log.emit(
                    Level::Debug,
                    Domain::Risk,
                    "budget_violation_skip",
                    obj(&[
                        ("symbol", v_str(&symbol)),
                        ("cost", v_num(cost)),
                        ("budget", v_num(budget)),
                    ]),
                );
                continue;
            }
            let submitted = match alloc.side {
                Side::Long => self.feed.buy_long(&symbol, qty),
                Side::Short => self.feed.buy_short(&symbol, qty),
            };
            match submitted {
                Ok(fill_price) => {
                    spendable -= cost;
                    let inst = &mut self.session.instruments[alloc.index];
                    if inst.opened_tick == 0 {
                        inst.opened_tick = tick;
                    }
                    inst.ticks_since_action = 0;
                    self.router.note_entry();
                    self.log.emit(
                        Level::Info,
                        Domain::Exec,
                        "entry",
                        obj(&[
                            ("symbol", v_str(&symbol)),
                            ("side", v_str(alloc.side.as_str())),
                            ("qty", v_num(qty)),
                            ("fill_price", v_num(fill_price)),
                            ("cost", v_num(cost)),
                        ]),
                    );
                    if self.router.policy == Policy::SingleBet {
                        break;
                    }
                }
                Err(err) => {
                    if alloc.side == Side::Short {
                        // Short execution disappearing is a capability loss,
                        // not a transient: disable the path for the session.
                        self.short_support = false;
                        self.log.emit(
                            Level::Warn,
                            Domain::System,
                            "short_support_downgraded",
                            obj(&[("error", v_str(&err.to_string()))]),
                        );
                    } else {
                        self.log.emit(
                            Level::Warn,
                            Domain::Exec,
                            "entry_order_failed",
                            obj(&[
                                ("symbol", v_str(&symbol)),
                                ("error", v_str(&err.to_string())),
                            ]),
                        );
                    }
                }
            }
        }
    }

    fn instrument_exposure(&self, inst: &Instrument) -> f64 {
        let mut value = 0.0;
        if inst.long_qty > 0.0 {
            value += self
                .feed
                .sale_gain(&inst.symbol, inst.long_qty, Side::Long)
                .unwrap_or_else(|_| inst.long_qty * inst.history.last().unwrap_or(inst.long_avg));
        }
        if inst.short_qty > 0.0 {
            value += self
                .feed
                .sale_gain(&inst.symbol, inst.short_qty, Side::Short)
                .unwrap_or_else(|_| inst.short_qty * inst.short_avg);
        }
        value
    }

    fn emit_snapshot(&self) {
        let invested = self.invested_value();
        let worth = self.session.portfolio.cash + invested;
        self.log.snapshot(obj(&[
            ("tick", v_num(self.session.tick as f64)),
            ("total_worth", v_num(worth)),
            ("realized_profit", v_num(self.session.portfolio.realized_profit)),
            ("trade_count", v_num(self.session.portfolio.trade_count as f64)),
            ("open_positions", v_num(self.session.open_position_count() as f64)),
            ("policy", v_str(self.router.policy.as_str())),
            ("buy_forecast", v_num(self.cfg.buy_long_forecast)),
            ("er_entry", v_num(self.cfg.er_entry)),
            ("per_instrument_cap", v_num(self.cfg.per_instrument_cap)),
        ]));
    }
}

/// The concentrated policy only takes signals where both data sources point
/// the same way with a margin; without authoritative data the estimate alone
/// must clear the margin.
fn conviction_agrees(inst: &Instrument, margin: f64) -> bool {
    let est = inst.est_forecast;
    match inst.auth_forecast {
        Some(auth) => {
            (auth - 0.5 > margin && est - 0.5 > margin)
                || (0.5 - auth > margin && 0.5 - est > margin)
        }
        None => (est - 0.5).abs() > margin,
    }
}

// =============================================================================
// Tests
// =============================================================================
