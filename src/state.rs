//! Session state: configuration, per-instrument data, portfolio.
//!
//! Everything here is owned by one engine instance and passed explicitly
//! through the tick loop. Position and cash fields mirror the market
//! collaborator and are refreshed from it every tick before being read.

use std::collections::VecDeque;

use crate::market::{PositionSnapshot, Side};
use crate::regime::RegimeFlipDetector;

// =============================================================================
// Configuration
// =============================================================================

/// Tunable parameters for one strategy run. A value object: the engine holds
/// a private copy, and adaptive variants mutate that copy only.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Max retained price samples per instrument
    pub history_capacity: usize,
    /// Long estimation window (transitions)
    pub long_window: usize,
    /// Short estimation window (transitions)
    pub short_window: usize,
    /// Minimum long/short forecast gap for a raw inversion signal
    pub inversion_delta: f64,
    /// Forecast needed to open a long; shorts mirror around 0.5
    pub buy_long_forecast: f64,
    /// Forecast below which a long exits; shorts mirror around 0.5
    pub sell_long_forecast: f64,
    /// Tightening applied to the exit threshold while a flip is suspected
    pub early_exit_offset: f64,
    /// Minimum |expected return| to consider an entry
    pub er_entry: f64,
    /// Exit buffer on the expected-return zero crossing when running on
    /// estimated signals
    pub er_exit_buffer: f64,
    /// Max fraction of total worth committed to one instrument
    pub per_instrument_cap: f64,
    /// Max concurrent positions (policy presets override)
    pub max_positions: usize,
    /// Cash floor that is never deployed
    pub reserve_cash: f64,
    /// Max fraction of total worth deployed across all positions
    pub max_deploy_fraction: f64,
    /// Orders below this value are not worth the commission
    pub min_order_value: f64,
    /// Position age after which a neutral forecast forces an exit
    pub stale_exit_ticks: u64,
    /// Half-width of the neutral forecast band around 0.5
    pub neutral_band: f64,
    /// Drawdown from peak worth that suspends new entries
    pub drawdown_halt: f64,
    /// |expected return| floor below which the market counts as flat
    pub flat_er_floor: f64,
    /// Consecutive flat ticks before the buy phase is skipped
    pub flat_ticks_limit: u32,
    /// Minimum position age before the profit lock may fire
    pub early_lock_min_ticks: u64,
    /// Unrealized return that triggers the profit lock
    pub early_lock_return: f64,
    /// Conviction forecast for the single-bet policy
    pub single_bet_forecast: f64,
    /// Forecast agreement margin required by the concentrated policy
    pub conviction_margin: f64,
    /// Wall-clock cooldown after a losing single-bet exit
    pub cooldown_ms: u64,
    /// Blend authoritative and estimated forecasts (cross-validation mode)
    pub blend_signals: bool,
    /// Scale the per-instrument cap by adaptive confidence
    pub confidence_scaled: bool,
    /// Enable the adaptive meta-layer
    pub adaptive: bool,
    /// Minimum ticks between adaptive adjustments
    pub adapt_every_ticks: u64,
    /// Rolling window of closed trades for the win rate
    pub adapt_window: usize,
    /// Closed trades required before the first adjustment
    pub adapt_min_trades: usize,
    pub win_rate_upper: f64,
    pub win_rate_lower: f64,
    /// Per-adjustment step sizes
    pub forecast_step: f64,
    pub cap_step: f64,
    pub er_step: f64,
    /// Independent clamps for every adjusted parameter
    pub buy_forecast_min: f64,
    pub buy_forecast_max: f64,
    pub cap_min: f64,
    pub cap_max: f64,
    pub er_entry_min: f64,
    pub er_entry_max: f64,
    /// Snapshot log cadence
    pub snapshot_every_ticks: u64,
    /// Upper bound on the tick wait before the loop proceeds anyway
    pub tick_fallback_ms: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            history_capacity: 120,
            long_window: 40,
            short_window: 10,
            inversion_delta: 0.15,
            buy_long_forecast: 0.6,
            sell_long_forecast: 0.5,
            early_exit_offset: 0.025,
            er_entry: 0.001,
            er_exit_buffer: 0.0002,
            per_instrument_cap: 0.2,
            max_positions: 8,
            reserve_cash: 50_000.0,
            max_deploy_fraction: 0.85,
            min_order_value: 5_000.0,
            stale_exit_ticks: 40,
            neutral_band: 0.05,
            drawdown_halt: 0.1,
            flat_er_floor: 0.0003,
            flat_ticks_limit: 30,
            early_lock_min_ticks: 10,
            early_lock_return: 0.1,
            single_bet_forecast: 0.65,
            conviction_margin: 0.03,
            cooldown_ms: 600_000,
            blend_signals: false,
            confidence_scaled: false,
            adaptive: false,
            adapt_every_ticks: 50,
            adapt_window: 20,
            adapt_min_trades: 10,
            win_rate_upper: 0.6,
            win_rate_lower: 0.4,
            forecast_step: 0.005,
            cap_step: 0.02,
            er_step: 0.0001,
            buy_forecast_min: 0.55,
            buy_forecast_max: 0.7,
            cap_min: 0.05,
            cap_max: 0.4,
            er_entry_min: 0.0004,
            er_entry_max: 0.003,
            snapshot_every_ticks: 25,
            tick_fallback_ms: 8_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl StrategyConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            history_capacity: env_parse("HISTORY_CAP", d.history_capacity),
            long_window: env_parse("LONG_WINDOW", d.long_window),
            short_window: env_parse("SHORT_WINDOW", d.short_window),
            inversion_delta: env_parse("INVERSION_DELTA", d.inversion_delta),
            buy_long_forecast: env_parse("BUY_FORECAST", d.buy_long_forecast),
            sell_long_forecast: env_parse("SELL_FORECAST", d.sell_long_forecast),
            early_exit_offset: env_parse("EARLY_EXIT_OFFSET", d.early_exit_offset),
            er_entry: env_parse("ER_ENTRY", d.er_entry),
            er_exit_buffer: env_parse("ER_EXIT_BUFFER", d.er_exit_buffer),
            per_instrument_cap: env_parse("PER_CAP", d.per_instrument_cap),
            max_positions: env_parse("MAX_POSITIONS", d.max_positions),
            reserve_cash: env_parse("RESERVE_CASH", d.reserve_cash),
            max_deploy_fraction: env_parse("MAX_DEPLOY", d.max_deploy_fraction),
            min_order_value: env_parse("MIN_ORDER", d.min_order_value),
            stale_exit_ticks: env_parse("STALE_TICKS", d.stale_exit_ticks),
            neutral_band: env_parse("NEUTRAL_BAND", d.neutral_band),
            drawdown_halt: env_parse("DRAWDOWN_HALT", d.drawdown_halt),
            flat_er_floor: env_parse("FLAT_ER_FLOOR", d.flat_er_floor),
            flat_ticks_limit: env_parse("FLAT_TICKS", d.flat_ticks_limit),
            early_lock_min_ticks: env_parse("LOCK_MIN_TICKS", d.early_lock_min_ticks),
            early_lock_return: env_parse("LOCK_RETURN", d.early_lock_return),
            single_bet_forecast: env_parse("SINGLE_BET_FORECAST", d.single_bet_forecast),
            conviction_margin: env_parse("CONVICTION_MARGIN", d.conviction_margin),
            cooldown_ms: env_parse("COOLDOWN_MS", d.cooldown_ms),
            blend_signals: env_flag("BLEND_SIGNALS", d.blend_signals),
            confidence_scaled: env_flag("CONFIDENCE_SCALED", d.confidence_scaled),
            adaptive: env_flag("ADAPTIVE", d.adaptive),
            adapt_every_ticks: env_parse("ADAPT_EVERY", d.adapt_every_ticks),
            adapt_window: env_parse("ADAPT_WINDOW", d.adapt_window),
            adapt_min_trades: env_parse("ADAPT_MIN_TRADES", d.adapt_min_trades),
            win_rate_upper: env_parse("WIN_UPPER", d.win_rate_upper),
            win_rate_lower: env_parse("WIN_LOWER", d.win_rate_lower),
            snapshot_every_ticks: env_parse("SNAPSHOT_EVERY", d.snapshot_every_ticks),
            tick_fallback_ms: env_parse("TICK_FALLBACK_MS", d.tick_fallback_ms),
            ..d
        }
    }

    /// Effective long-entry threshold mirrored for the short side.
    pub fn buy_short_forecast(&self) -> f64 {
        1.0 - self.buy_long_forecast
    }

    pub fn sell_short_forecast(&self) -> f64 {
        1.0 - self.sell_long_forecast
    }
}

// =============================================================================
// Price history
// =============================================================================

/// Bounded rolling price window, oldest first.
#[derive(Debug, Clone)]
pub struct PriceHistory {
    prices: Vec<f64>,
    capacity: usize,
}

impl PriceHistory {
    pub fn new(capacity: usize) -> Self {
        Self { prices: Vec::with_capacity(capacity.max(1)), capacity: capacity.max(1) }
    }

    pub fn push(&mut self, price: f64) {
        self.prices.push(price);
        if self.prices.len() > self.capacity {
            let excess = self.prices.len() - self.capacity;
            self.prices.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn last(&self) -> Option<f64> {
        self.prices.last().copied()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.prices
    }
}

// =============================================================================
// Instruments
// =============================================================================

/// Per-instrument state. Position fields mirror the collaborator's
/// `position()` snapshot and are never accumulated locally.
#[derive(Debug, Clone)]
pub struct Instrument {
    pub symbol: String,
    pub history: PriceHistory,
    /// Authoritative signals, present only while the data capability holds
    pub auth_forecast: Option<f64>,
    pub auth_volatility: Option<f64>,
    /// Estimated signals, recomputed every tick from the history
    pub est_forecast: f64,
    pub est_forecast_short: f64,
    pub est_volatility: f64,
    pub momentum: f64,
    pub flip: RegimeFlipDetector,
    pub long_qty: f64,
    pub long_avg: f64,
    pub short_qty: f64,
    pub short_avg: f64,
    /// Tick the current position was opened; 0 while flat
    pub opened_tick: u64,
    pub ticks_since_action: u64,
    /// Signed expected return cached for the current tick
    pub expected_return: f64,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, history_capacity: usize) -> Self {
        Self {
            symbol: symbol.into(),
            history: PriceHistory::new(history_capacity),
            auth_forecast: None,
            auth_volatility: None,
            est_forecast: 0.5,
            est_forecast_short: 0.5,
            est_volatility: 0.01,
            momentum: 0.0,
            flip: RegimeFlipDetector::new(),
            long_qty: 0.0,
            long_avg: 0.0,
            short_qty: 0.0,
            short_avg: 0.0,
            opened_tick: 0,
            ticks_since_action: 0,
            expected_return: 0.0,
        }
    }

    /// Best available forecast: authoritative when granted, else estimated.
    pub fn forecast(&self) -> f64 {
        self.auth_forecast.unwrap_or(self.est_forecast)
    }

    pub fn volatility(&self) -> f64 {
        self.auth_volatility.unwrap_or(self.est_volatility)
    }

    pub fn has_position(&self) -> bool {
        self.long_qty > 0.0 || self.short_qty > 0.0
    }

    pub fn qty(&self, side: Side) -> f64 {
        match side {
            Side::Long => self.long_qty,
            Side::Short => self.short_qty,
        }
    }

    pub fn avg_entry(&self, side: Side) -> f64 {
        match side {
            Side::Long => self.long_avg,
            Side::Short => self.short_avg,
        }
    }

    /// Apply an authoritative position snapshot and keep `opened_tick`
    /// consistent with it.
    pub fn apply_position(&mut self, snap: PositionSnapshot, tick: u64) {
        self.long_qty = snap.long_qty.max(0.0);
        self.long_avg = snap.long_avg;
        self.short_qty = snap.short_qty.max(0.0);
        self.short_avg = snap.short_avg;
        if !self.has_position() {
            self.opened_tick = 0;
        } else if self.opened_tick == 0 {
            self.opened_tick = tick;
        }
    }

    /// Position age in ticks; 0 while flat.
    pub fn position_age(&self, tick: u64) -> u64 {
        if self.opened_tick == 0 {
            0
        } else {
            tick.saturating_sub(self.opened_tick)
        }
    }
}

// =============================================================================
// Portfolio
// =============================================================================

#[derive(Debug, Clone)]
pub struct PortfolioState {
    /// Mirrors the collaborator's reported cash
    pub cash: f64,
    /// Session peak of total worth, monotone non-decreasing
    pub peak_worth: f64,
    pub realized_profit: f64,
    pub trade_count: u64,
}

impl PortfolioState {
    pub fn new(starting_cash: f64) -> Self {
        Self {
            cash: starting_cash,
            peak_worth: starting_cash,
            realized_profit: 0.0,
            trade_count: 0,
        }
    }

    pub fn note_worth(&mut self, worth: f64) {
        if worth > self.peak_worth {
            self.peak_worth = worth;
        }
    }
}

// =============================================================================
// Trade records
// =============================================================================

#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub tick_closed: u64,
    /// Diagnostic exit tag, e.g. "stale" or "early"
    pub tag: &'static str,
}

// =============================================================================
// Session
// =============================================================================

/// All mutable engine state for one run. Created at startup from the
/// collaborator's symbol list and reported cash; nothing persists across
/// restarts.
pub struct Session {
    pub tick: u64,
    pub instruments: Vec<Instrument>,
    pub portfolio: PortfolioState,
    /// Most recent closed trades, newest last, bounded
    pub recent_trades: VecDeque<TradeRecord>,
}

const RECENT_TRADES_CAP: usize = 256;

impl Session {
    pub fn new(symbols: Vec<String>, starting_cash: f64, history_capacity: usize) -> Self {
        let instruments = symbols
            .into_iter()
            .map(|s| Instrument::new(s, history_capacity))
            .collect();
        Self {
            tick: 0,
            instruments,
            portfolio: PortfolioState::new(starting_cash),
            recent_trades: VecDeque::new(),
        }
    }

    pub fn record_trade(&mut self, rec: TradeRecord) {
        self.portfolio.realized_profit += rec.pnl;
        self.portfolio.trade_count += 1;
        self.recent_trades.push_back(rec);
        if self.recent_trades.len() > RECENT_TRADES_CAP {
            self.recent_trades.pop_front();
        }
    }

    pub fn open_position_count(&self) -> usize {
        self.instruments.iter().filter(|i| i.has_position()).count()
    }
}

// =============================================================================
// Tests
// =============================================================================
