use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use quantick::engine::Engine;
use quantick::logging::JsonlLogger;
use quantick::market::sim::{SimFeed, SimInstrumentCfg};
use quantick::state::StrategyConfig;
use quantick::strategy::Policy;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// A small simulated universe for paper runs. Symbols, drifts and
/// volatilities are fixed so repeated runs with the same seed reproduce.
fn build_sim_feed() -> SimFeed {
    let defs = vec![
        ("FLCM", 120.0, 0.62, 0.012),
        ("SGCO", 85.0, 0.55, 0.020),
        ("OMTK", 310.0, 0.48, 0.009),
        ("HLDR", 42.0, 0.40, 0.025),
        ("VRTA", 150.0, 0.58, 0.015),
        ("CTYS", 64.0, 0.51, 0.018),
        ("PLEX", 230.0, 0.66, 0.011),
        ("NVMD", 18.0, 0.45, 0.030),
    ]
    .into_iter()
    .map(|(symbol, start_price, forecast, volatility)| SimInstrumentCfg {
        symbol: symbol.to_string(),
        start_price,
        forecast,
        volatility,
    })
    .collect();

    SimFeed::new(defs, env_parse("SIM_CASH", 1_000_000.0), env_parse("SIM_SEED", 7))
        .with_tick_interval(Duration::from_millis(env_parse("SIM_TICK_MS", 6_000)))
        .with_access(
            std::env::var("SIM_NO_AUTH_DATA").is_err(),
            std::env::var("SIM_NO_SHORTS").is_err(),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = StrategyConfig::from_env();
    let policy = Policy::from_env();
    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
    let logger = Arc::new(JsonlLogger::create(&log_dir)?);
    let feed = Arc::new(build_sim_feed());

    let mut engine = Engine::new(feed, logger, cfg, policy)?;
    engine.run().await
}
