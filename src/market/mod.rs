//! Market/execution collaborator interface.
//!
//! The engine never talks to a venue directly; everything goes through
//! [`MarketFeed`]. Quotes from `purchase_cost`/`sale_gain` already include
//! spread and commission and back all budget and P&L math. Execution methods
//! take `&self` so implementations use interior mutability and a single
//! instance can be shared read-only across engine instances.

use anyhow::Result;
use async_trait::async_trait;

pub mod sim;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

/// Authoritative position state for one instrument, resynced every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PositionSnapshot {
    pub long_qty: f64,
    pub long_avg: f64,
    pub short_qty: f64,
    pub short_avg: f64,
}

impl PositionSnapshot {
    pub fn is_flat(&self) -> bool {
        self.long_qty <= 0.0 && self.short_qty <= 0.0
    }
}

#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Ordered set of tradable symbols, stable for the session.
    fn symbols(&self) -> Vec<String>;

    fn price(&self, sym: &str) -> Result<f64>;
    fn bid_price(&self, sym: &str) -> Result<f64>;
    fn ask_price(&self, sym: &str) -> Result<f64>;

    /// Authoritative up-probability in [0,1]. Gated by
    /// `has_authoritative_data`; errors downgrade the capability.
    fn forecast(&self, sym: &str) -> Result<f64>;
    /// Authoritative volatility, >= 0. Same gating as `forecast`.
    fn volatility(&self, sym: &str) -> Result<f64>;

    fn position(&self, sym: &str) -> Result<PositionSnapshot>;
    fn cash(&self) -> Result<f64>;
    fn commission(&self) -> f64;

    /// Execution. Returns the fill price. A failure means no state change.
    fn buy_long(&self, sym: &str, qty: f64) -> Result<f64>;
    fn buy_short(&self, sym: &str, qty: f64) -> Result<f64>;
    fn sell_long(&self, sym: &str, qty: f64) -> Result<f64>;
    fn sell_short(&self, sym: &str, qty: f64) -> Result<f64>;

    /// Total cost to open `qty` on `side`, inclusive of spread + commission.
    fn purchase_cost(&self, sym: &str, qty: f64, side: Side) -> Result<f64>;
    /// Total proceeds from closing `qty` on `side`, inclusive of spread +
    /// commission.
    fn sale_gain(&self, sym: &str, qty: f64, side: Side) -> Result<f64>;

    fn has_basic_access(&self) -> bool;
    fn has_authoritative_data(&self) -> bool;
    fn has_short_support(&self) -> bool;

    /// Block until the next market update. Callers wrap this in a bounded
    /// timeout so a misbehaving source cannot stall the loop.
    async fn next_tick(&self);
}
