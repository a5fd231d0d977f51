//! Simulated market feeds.
//!
//! [`SimFeed`] is a seeded random-walk venue for paper runs: prices drift
//! according to their own forecast, quotes carry a spread and a flat
//! commission. [`ScriptedFeed`] replays fixed price/signal scripts and
//! records every order, which makes engine behavior fully deterministic in
//! tests. Both keep positions and cash as the authoritative source of truth
//! the engine resyncs from.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{MarketFeed, PositionSnapshot, Side};

// =============================================================================
// Shared account bookkeeping
// =============================================================================

#[derive(Debug, Clone, Default)]
struct Account {
    long_qty: f64,
    long_avg: f64,
    short_qty: f64,
    short_avg: f64,
}

impl Account {
    fn snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            long_qty: self.long_qty,
            long_avg: self.long_avg,
            short_qty: self.short_qty,
            short_avg: self.short_avg,
        }
    }

    fn add(&mut self, side: Side, qty: f64, price: f64) {
        match side {
            Side::Long => {
                let total = self.long_qty + qty;
                if total > 0.0 {
                    self.long_avg = (self.long_avg * self.long_qty + price * qty) / total;
                }
                self.long_qty = total;
            }
            Side::Short => {
                let total = self.short_qty + qty;
                if total > 0.0 {
                    self.short_avg = (self.short_avg * self.short_qty + price * qty) / total;
                }
                self.short_qty = total;
            }
        }
    }

    fn remove(&mut self, side: Side, qty: f64) {
        match side {
            Side::Long => {
                self.long_qty = (self.long_qty - qty).max(0.0);
                if self.long_qty == 0.0 {
                    self.long_avg = 0.0;
                }
            }
            Side::Short => {
                self.short_qty = (self.short_qty - qty).max(0.0);
                if self.short_qty == 0.0 {
                    self.short_avg = 0.0;
                }
            }
        }
    }
}

/// Proceeds of closing `qty` on `side`: longs sell at the bid, shorts cover
/// at the ask and keep the entry-to-cover difference.
fn close_gain(side: Side, qty: f64, avg: f64, bid: f64, ask: f64, commission: f64) -> f64 {
    match side {
        Side::Long => qty * bid - commission,
        Side::Short => qty * avg + (avg - ask) * qty - commission,
    }
}

fn open_cost(side: Side, qty: f64, bid: f64, ask: f64, commission: f64) -> f64 {
    match side {
        Side::Long => qty * ask + commission,
        Side::Short => qty * bid + commission,
    }
}

// =============================================================================
// Random-walk feed
// =============================================================================

#[derive(Debug, Clone)]
pub struct SimInstrumentCfg {
    pub symbol: String,
    pub start_price: f64,
    pub forecast: f64,
    pub volatility: f64,
}

struct SimInstrument {
    cfg: SimInstrumentCfg,
    price: f64,
    forecast: f64,
    account: Account,
}

struct SimInner {
    instruments: Vec<SimInstrument>,
    cash: f64,
    rng: StdRng,
}

pub struct SimFeed {
    inner: Mutex<SimInner>,
    tick_interval: Duration,
    spread: f64,
    commission: f64,
    authoritative: bool,
    shorts: bool,
}

impl SimFeed {
    pub fn new(defs: Vec<SimInstrumentCfg>, cash: f64, seed: u64) -> Self {
        let instruments = defs
            .into_iter()
            .map(|cfg| SimInstrument {
                price: cfg.start_price,
                forecast: cfg.forecast.clamp(0.05, 0.95),
                account: Account::default(),
                cfg,
            })
            .collect();
        Self {
            inner: Mutex::new(SimInner { instruments, cash, rng: StdRng::seed_from_u64(seed) }),
            tick_interval: Duration::from_millis(6_000),
            spread: 0.005,
            commission: 100.0,
            authoritative: true,
            shorts: true,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_access(mut self, authoritative: bool, shorts: bool) -> Self {
        self.authoritative = authoritative;
        self.shorts = shorts;
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SimInner>> {
        self.inner.lock().map_err(|_| anyhow!("sim feed state poisoned"))
    }

    /// Advance the walk one tick: each price moves up with its forecast
    /// probability by a volatility-sized step, and forecasts wander slowly.
    pub fn advance(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            let SimInner { instruments, rng, .. } = &mut *inner;
            for inst in instruments.iter_mut() {
                let up = rng.gen::<f64>() < inst.forecast;
                let step = inst.cfg.volatility * rng.gen::<f64>();
                inst.price *= if up { 1.0 + step } else { 1.0 / (1.0 + step) };
                inst.forecast =
                    (inst.forecast + 0.02 * (rng.gen::<f64>() - 0.5)).clamp(0.05, 0.95);
            }
        }
    }

    fn with_instrument<T>(
        &self,
        sym: &str,
        f: impl FnOnce(&mut SimInner, usize) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.lock()?;
        let idx = inner
            .instruments
            .iter()
            .position(|i| i.cfg.symbol == sym)
            .ok_or_else(|| anyhow!("unknown symbol {}", sym))?;
        f(&mut inner, idx)
    }

    fn quote(&self, sym: &str) -> Result<(f64, f64, f64)> {
        self.with_instrument(sym, |inner, idx| {
            let p = inner.instruments[idx].price;
            Ok((p, p * (1.0 - self.spread / 2.0), p * (1.0 + self.spread / 2.0)))
        })
    }
}

#[async_trait]
impl MarketFeed for SimFeed {
    fn symbols(&self) -> Vec<String> {
        match self.inner.lock() {
            Ok(inner) => inner.instruments.iter().map(|i| i.cfg.symbol.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn price(&self, sym: &str) -> Result<f64> {
        Ok(self.quote(sym)?.0)
    }

    fn bid_price(&self, sym: &str) -> Result<f64> {
        Ok(self.quote(sym)?.1)
    }

    fn ask_price(&self, sym: &str) -> Result<f64> {
        Ok(self.quote(sym)?.2)
    }

    fn forecast(&self, sym: &str) -> Result<f64> {
        if !self.authoritative {
            bail!("authoritative data not granted");
        }
        self.with_instrument(sym, |inner, idx| Ok(inner.instruments[idx].forecast))
    }

    fn volatility(&self, sym: &str) -> Result<f64> {
        if !self.authoritative {
            bail!("authoritative data not granted");
        }
        self.with_instrument(sym, |inner, idx| Ok(inner.instruments[idx].cfg.volatility))
    }

    fn position(&self, sym: &str) -> Result<PositionSnapshot> {
        self.with_instrument(sym, |inner, idx| Ok(inner.instruments[idx].account.snapshot()))
    }

    fn cash(&self) -> Result<f64> {
        Ok(self.lock()?.cash)
    }

    fn commission(&self) -> f64 {
        self.commission
    }

    fn buy_long(&self, sym: &str, qty: f64) -> Result<f64> {
        let (_, bid, ask) = self.quote(sym)?;
        self.with_instrument(sym, |inner, idx| {
            let cost = open_cost(Side::Long, qty, bid, ask, self.commission);
            if cost > inner.cash {
                bail!("insufficient cash for {} x {}", sym, qty);
            }
            inner.cash -= cost;
            inner.instruments[idx].account.add(Side::Long, qty, ask);
            Ok(ask)
        })
    }

    fn buy_short(&self, sym: &str, qty: f64) -> Result<f64> {
        if !self.shorts {
            bail!("short selling not granted");
        }
        let (_, bid, ask) = self.quote(sym)?;
        self.with_instrument(sym, |inner, idx| {
            let cost = open_cost(Side::Short, qty, bid, ask, self.commission);
            if cost > inner.cash {
                bail!("insufficient cash for short {} x {}", sym, qty);
            }
            inner.cash -= cost;
            inner.instruments[idx].account.add(Side::Short, qty, bid);
            Ok(bid)
        })
    }

    fn sell_long(&self, sym: &str, qty: f64) -> Result<f64> {
        let (_, bid, ask) = self.quote(sym)?;
        self.with_instrument(sym, |inner, idx| {
            let acct = &mut inner.instruments[idx].account;
            let qty = qty.min(acct.long_qty);
            if qty <= 0.0 {
                bail!("no long position in {}", sym);
            }
            let gain = close_gain(Side::Long, qty, acct.long_avg, bid, ask, self.commission);
            acct.remove(Side::Long, qty);
            inner.cash += gain;
            Ok(bid)
        })
    }

    fn sell_short(&self, sym: &str, qty: f64) -> Result<f64> {
        let (_, bid, ask) = self.quote(sym)?;
        self.with_instrument(sym, |inner, idx| {
            let acct = &mut inner.instruments[idx].account;
            let qty = qty.min(acct.short_qty);
            if qty <= 0.0 {
                bail!("no short position in {}", sym);
            }
            let gain = close_gain(Side::Short, qty, acct.short_avg, bid, ask, self.commission);
            acct.remove(Side::Short, qty);
            inner.cash += gain;
            Ok(ask)
        })
    }

    fn purchase_cost(&self, sym: &str, qty: f64, side: Side) -> Result<f64> {
        let (_, bid, ask) = self.quote(sym)?;
        Ok(open_cost(side, qty, bid, ask, self.commission))
    }

    fn sale_gain(&self, sym: &str, qty: f64, side: Side) -> Result<f64> {
        let (_, bid, ask) = self.quote(sym)?;
        self.with_instrument(sym, |inner, idx| {
            let acct = &inner.instruments[idx].account;
            let avg = match side {
                Side::Long => acct.long_avg,
                Side::Short => acct.short_avg,
            };
            Ok(close_gain(side, qty, avg, bid, ask, self.commission))
        })
    }

    fn has_basic_access(&self) -> bool {
        true
    }

    fn has_authoritative_data(&self) -> bool {
        self.authoritative
    }

    fn has_short_support(&self) -> bool {
        self.shorts
    }

    async fn next_tick(&self) {
        tokio::time::sleep(self.tick_interval).await;
        self.advance();
    }
}

// =============================================================================
// Scripted feed
// =============================================================================

#[derive(Debug, Clone)]
pub struct ScriptedInstrument {
    pub symbol: String,
    /// Price per tick; the last value repeats once the script runs out
    pub prices: Vec<f64>,
    pub forecasts: Option<Vec<f64>>,
    pub volatilities: Option<Vec<f64>>,
}

impl ScriptedInstrument {
    pub fn prices_only(symbol: impl Into<String>, prices: Vec<f64>) -> Self {
        Self { symbol: symbol.into(), prices, forecasts: None, volatilities: None }
    }
}

/// One executed order, for test assertions.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub symbol: String,
    pub side: Side,
    pub is_entry: bool,
    pub qty: f64,
    /// Cost for entries, proceeds for exits
    pub money: f64,
    pub step: usize,
}

struct ScriptedInner {
    instruments: Vec<(ScriptedInstrument, Account)>,
    step: usize,
    cash: f64,
    orders: Vec<OrderRecord>,
    fail_orders: usize,
}

pub struct ScriptedFeed {
    inner: Mutex<ScriptedInner>,
    commission: f64,
    basic: bool,
    authoritative: bool,
    shorts: bool,
}

fn at<T: Copy>(script: &[T], step: usize) -> Option<T> {
    if script.is_empty() {
        None
    } else {
        Some(script[step.min(script.len() - 1)])
    }
}

impl ScriptedFeed {
    pub fn new(instruments: Vec<ScriptedInstrument>, cash: f64) -> Self {
        Self {
            inner: Mutex::new(ScriptedInner {
                instruments: instruments.into_iter().map(|i| (i, Account::default())).collect(),
                step: 0,
                cash,
                orders: Vec::new(),
                fail_orders: 0,
            }),
            commission: 100.0,
            basic: true,
            authoritative: false,
            shorts: false,
        }
    }

    pub fn with_access(mut self, basic: bool, authoritative: bool, shorts: bool) -> Self {
        self.basic = basic;
        self.authoritative = authoritative;
        self.shorts = shorts;
        self
    }

    pub fn with_commission(mut self, commission: f64) -> Self {
        self.commission = commission;
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ScriptedInner>> {
        self.inner.lock().map_err(|_| anyhow!("scripted feed state poisoned"))
    }

    pub fn advance(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.step += 1;
        }
    }

    pub fn step(&self) -> usize {
        self.inner.lock().map(|i| i.step).unwrap_or(0)
    }

    pub fn cash_now(&self) -> f64 {
        self.inner.lock().map(|i| i.cash).unwrap_or(0.0)
    }

    pub fn orders(&self) -> Vec<OrderRecord> {
        self.inner.lock().map(|i| i.orders.clone()).unwrap_or_default()
    }

    /// Make the next `n` execution calls fail without state change.
    pub fn fail_next_orders(&self, n: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_orders = n;
        }
    }

    fn find(inner: &ScriptedInner, sym: &str) -> Result<usize> {
        inner
            .instruments
            .iter()
            .position(|(i, _)| i.symbol == sym)
            .ok_or_else(|| anyhow!("unknown symbol {}", sym))
    }

    fn price_at(inner: &ScriptedInner, idx: usize) -> Result<f64> {
        at(&inner.instruments[idx].0.prices, inner.step)
            .ok_or_else(|| anyhow!("empty price script"))
    }

    fn consume_failure(inner: &mut ScriptedInner) -> bool {
        if inner.fail_orders > 0 {
            inner.fail_orders -= 1;
            true
        } else {
            false
        }
    }

    fn execute_entry(&self, sym: &str, qty: f64, side: Side) -> Result<f64> {
        let mut inner = self.lock()?;
        if Self::consume_failure(&mut inner) {
            bail!("order rejected");
        }
        let idx = Self::find(&inner, sym)?;
        let price = Self::price_at(&inner, idx)?;
        let cost = open_cost(side, qty, price, price, self.commission);
        if cost > inner.cash {
            bail!("insufficient cash for {} x {}", sym, qty);
        }
        inner.cash -= cost;
        let step = inner.step;
        inner.instruments[idx].1.add(side, qty, price);
        inner.orders.push(OrderRecord {
            symbol: sym.to_string(),
            side,
            is_entry: true,
            qty,
            money: cost,
            step,
        });
        Ok(price)
    }

    fn execute_exit(&self, sym: &str, qty: f64, side: Side) -> Result<f64> {
        let mut inner = self.lock()?;
        if Self::consume_failure(&mut inner) {
            bail!("order rejected");
        }
        let idx = Self::find(&inner, sym)?;
        let price = Self::price_at(&inner, idx)?;
        let held = match side {
            Side::Long => inner.instruments[idx].1.long_qty,
            Side::Short => inner.instruments[idx].1.short_qty,
        };
        let qty = qty.min(held);
        if qty <= 0.0 {
            bail!("no {} position in {}", side.as_str(), sym);
        }
        let avg = match side {
            Side::Long => inner.instruments[idx].1.long_avg,
            Side::Short => inner.instruments[idx].1.short_avg,
        };
        let gain = close_gain(side, qty, avg, price, price, self.commission);
        inner.instruments[idx].1.remove(side, qty);
        inner.cash += gain;
        let step = inner.step;
        inner.orders.push(OrderRecord {
            symbol: sym.to_string(),
            side,
            is_entry: false,
            qty,
            money: gain,
            step,
        });
        Ok(price)
    }
}

#[async_trait]
impl MarketFeed for ScriptedFeed {
    fn symbols(&self) -> Vec<String> {
        match self.inner.lock() {
            Ok(inner) => inner.instruments.iter().map(|(i, _)| i.symbol.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn price(&self, sym: &str) -> Result<f64> {
        let inner = self.lock()?;
        let idx = Self::find(&inner, sym)?;
        Self::price_at(&inner, idx)
    }

    fn bid_price(&self, sym: &str) -> Result<f64> {
        self.price(sym)
    }

    fn ask_price(&self, sym: &str) -> Result<f64> {
        self.price(sym)
    }

    fn forecast(&self, sym: &str) -> Result<f64> {
        if !self.authoritative {
            bail!("authoritative data not granted");
        }
        let inner = self.lock()?;
        let idx = Self::find(&inner, sym)?;
        inner.instruments[idx]
            .0
            .forecasts
            .as_deref()
            .and_then(|s| at(s, inner.step))
            .ok_or_else(|| anyhow!("forecast feed unavailable"))
    }

    fn volatility(&self, sym: &str) -> Result<f64> {
        if !self.authoritative {
            bail!("authoritative data not granted");
        }
        let inner = self.lock()?;
        let idx = Self::find(&inner, sym)?;
        inner.instruments[idx]
            .0
            .volatilities
            .as_deref()
            .and_then(|s| at(s, inner.step))
            .ok_or_else(|| anyhow!("volatility feed unavailable"))
    }

    fn position(&self, sym: &str) -> Result<PositionSnapshot> {
        let inner = self.lock()?;
        let idx = Self::find(&inner, sym)?;
        Ok(inner.instruments[idx].1.snapshot())
    }

    fn cash(&self) -> Result<f64> {
        Ok(self.lock()?.cash)
    }

    fn commission(&self) -> f64 {
        self.commission
    }

    fn buy_long(&self, sym: &str, qty: f64) -> Result<f64> {
        self.execute_entry(sym, qty, Side::Long)
    }

    fn buy_short(&self, sym: &str, qty: f64) -> Result<f64> {
        if !self.shorts {
            bail!("short selling not granted");
        }
        self.execute_entry(sym, qty, Side::Short)
    }

    fn sell_long(&self, sym: &str, qty: f64) -> Result<f64> {
        self.execute_exit(sym, qty, Side::Long)
    }

    fn sell_short(&self, sym: &str, qty: f64) -> Result<f64> {
        self.execute_exit(sym, qty, Side::Short)
    }

    fn purchase_cost(&self, sym: &str, qty: f64, side: Side) -> Result<f64> {
        let price = self.price(sym)?;
        Ok(open_cost(side, qty, price, price, self.commission))
    }

    fn sale_gain(&self, sym: &str, qty: f64, side: Side) -> Result<f64> {
        let inner = self.lock()?;
        let idx = Self::find(&inner, sym)?;
        let price = Self::price_at(&inner, idx)?;
        let avg = match side {
            Side::Long => inner.instruments[idx].1.long_avg,
            Side::Short => inner.instruments[idx].1.short_avg,
        };
        Ok(close_gain(side, qty, avg, price, price, self.commission))
    }

    fn has_basic_access(&self) -> bool {
        self.basic
    }

    fn has_authoritative_data(&self) -> bool {
        self.authoritative
    }

    fn has_short_support(&self) -> bool {
        self.shorts
    }

    async fn next_tick(&self) {
        self.advance();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn scripted() -> ScriptedFeed {
        ScriptedFeed::new(
            vec![ScriptedInstrument::prices_only("ABC", vec![100.0, 110.0, 120.0])],
            100_000.0,
        )
        .with_commission(10.0)
    }

    #[test]
    fn scripted_prices_follow_the_script_and_clamp() {
        let feed = scripted();
        assert_eq!(feed.price("ABC").unwrap(), 100.0);
        feed.advance();
        assert_eq!(feed.price("ABC").unwrap(), 110.0);
        feed.advance();
        feed.advance();
        feed.advance();
        // Past the end the last value repeats.
        assert_eq!(feed.price("ABC").unwrap(), 120.0);
    }

    #[test]
    fn scripted_round_trip_accounting() {
        let feed = scripted();
        let fill = feed.buy_long("ABC", 10.0).unwrap();
        assert_eq!(fill, 100.0);
        assert!((feed.cash_now() - (100_000.0 - 1_010.0)).abs() < 1e-9);
        let snap = feed.position("ABC").unwrap();
        assert_eq!(snap.long_qty, 10.0);
        assert_eq!(snap.long_avg, 100.0);

        feed.advance(); // price 110
        let quoted = feed.sale_gain("ABC", 10.0, Side::Long).unwrap();
        assert!((quoted - (1_100.0 - 10.0)).abs() < 1e-9);
        feed.sell_long("ABC", 10.0).unwrap();
        assert!((feed.cash_now() - (100_000.0 - 1_010.0 + 1_090.0)).abs() < 1e-9);
        assert!(feed.position("ABC").unwrap().is_flat());
        assert_eq!(feed.orders().len(), 2);
    }

    #[test]
    fn scripted_short_round_trip() {
        let feed = ScriptedFeed::new(
            vec![ScriptedInstrument::prices_only("ABC", vec![100.0, 90.0])],
            100_000.0,
        )
        .with_commission(0.0)
        .with_access(true, false, true);

        feed.buy_short("ABC", 10.0).unwrap();
        feed.advance();
        // Short from 100 covered at 90: 10 * 100 + 10 * 10 = 1100 back.
        let gain = feed.sale_gain("ABC", 10.0, Side::Short).unwrap();
        assert!((gain - 1_100.0).abs() < 1e-9);
        feed.sell_short("ABC", 10.0).unwrap();
        assert!((feed.cash_now() - 100_100.0).abs() < 1e-9);
    }

    #[test]
    fn scripted_rejects_overspend_and_failed_orders() {
        let feed = ScriptedFeed::new(
            vec![ScriptedInstrument::prices_only("ABC", vec![100.0])],
            500.0,
        );
        assert!(feed.buy_long("ABC", 100.0).is_err());
        assert!((feed.cash_now() - 500.0).abs() < 1e-9);

        let feed = scripted();
        feed.fail_next_orders(1);
        assert!(feed.buy_long("ABC", 1.0).is_err());
        // State unchanged after the injected failure; the next order works.
        assert!((feed.cash_now() - 100_000.0).abs() < 1e-9);
        assert!(feed.buy_long("ABC", 1.0).is_ok());
    }

    #[test]
    fn scripted_capability_gates() {
        let feed = scripted(); // no authoritative data, no shorts
        assert!(feed.forecast("ABC").is_err());
        assert!(feed.buy_short("ABC", 1.0).is_err());

        let feed = ScriptedFeed::new(
            vec![ScriptedInstrument {
                symbol: "ABC".into(),
                prices: vec![100.0],
                forecasts: Some(vec![0.7]),
                volatilities: Some(vec![0.02]),
            }],
            1_000.0,
        )
        .with_access(true, true, false);
        assert!((feed.forecast("ABC").unwrap() - 0.7).abs() < 1e-12);
        assert!((feed.volatility("ABC").unwrap() - 0.02).abs() < 1e-12);
    }

    #[test]
    fn sim_feed_walks_and_trades() {
        let feed = SimFeed::new(
            vec![SimInstrumentCfg {
                symbol: "SIM".into(),
                start_price: 100.0,
                forecast: 0.7,
                volatility: 0.02,
            }],
            1_000_000.0,
            42,
        );
        let p0 = feed.price("SIM").unwrap();
        for _ in 0..50 {
            feed.advance();
        }
        let p1 = feed.price("SIM").unwrap();
        assert_ne!(p0, p1);
        // Bid below ask around the mid.
        let bid = feed.bid_price("SIM").unwrap();
        let ask = feed.ask_price("SIM").unwrap();
        assert!(bid < p1 && p1 < ask);

        let cash0 = feed.cash().unwrap();
        feed.buy_long("SIM", 10.0).unwrap();
        assert!(feed.cash().unwrap() < cash0);
        feed.sell_long("SIM", 10.0).unwrap();
        assert!(feed.position("SIM").unwrap().is_flat());
    }

    #[test]
    fn sim_feed_quotes_include_commission() {
        let feed = SimFeed::new(
            vec![SimInstrumentCfg {
                symbol: "SIM".into(),
                start_price: 100.0,
                forecast: 0.5,
                volatility: 0.02,
            }],
            1_000_000.0,
            1,
        );
        let ask = feed.ask_price("SIM").unwrap();
        let cost = feed.purchase_cost("SIM", 10.0, Side::Long).unwrap();
        assert!((cost - (10.0 * ask + feed.commission())).abs() < 1e-9);
    }
}
