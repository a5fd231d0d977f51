//! Structured event logging.
//!
//! The engine's only produced interface: per-trade records, periodic
//! snapshots, and operational events as JSONL. Writers live behind the
//! [`EventLog`] trait so the engine takes a logger at construction; the
//! default [`JsonlLogger`] writes a run directory and mirrors to stdout,
//! [`NullLogger`] swallows everything for tests.

use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// =============================================================================
// Levels and domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Market,   // prices, estimates, signals
    Strategy, // entry/exit decisions
    Risk,     // gate results, halts
    Exec,     // order lifecycle
    Fill,     // closed trades
    Adaptive, // threshold adjustments
    System,   // startup, downgrades, snapshots
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Market => "market",
            Domain::Strategy => "strategy",
            Domain::Risk => "risk",
            Domain::Exec => "exec",
            Domain::Fill => "fill",
            Domain::Adaptive => "adaptive",
            Domain::System => "system",
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Sink trait
// =============================================================================

pub trait EventLog: Send + Sync {
    fn emit(&self, level: Level, domain: Domain, event: &str, fields: Map<String, Value>);

    /// A closed trade. Default routes through `emit`.
    fn trade(&self, fields: Map<String, Value>) {
        self.emit(Level::Info, Domain::Fill, "trade", fields);
    }

    /// Periodic `{tick, total_worth, realized_profit, parameters}` snapshot.
    fn snapshot(&self, fields: Map<String, Value>) {
        self.emit(Level::Info, Domain::System, "snapshot", fields);
    }
}

/// Discards everything. For tests and headless simulations.
pub struct NullLogger;

impl EventLog for NullLogger {
    fn emit(&self, _level: Level, _domain: Domain, _event: &str, _fields: Map<String, Value>) {}
}

// =============================================================================
// JSONL run-directory logger
// =============================================================================

pub struct JsonlLogger {
    run_id: String,
    min_level: Level,
    seq: AtomicU64,
    events: Mutex<BufWriter<File>>,
    trades: Mutex<BufWriter<File>>,
    snapshots: Mutex<BufWriter<File>>,
    mirror_stdout: bool,
}

impl JsonlLogger {
    /// Create a run directory under `base` and open the three streams.
    pub fn create(base: impl AsRef<Path>) -> Result<Self> {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", Utc::now().timestamp_millis(), process::id()));
        let mut run_dir = PathBuf::from(base.as_ref());
        run_dir.push(&run_id);
        create_dir_all(&run_dir)
            .with_context(|| format!("create run dir {}", run_dir.display()))?;

        let open = |name: &str| -> Result<Mutex<BufWriter<File>>> {
            let path = run_dir.join(name);
            let file =
                File::create(&path).with_context(|| format!("create {}", path.display()))?;
            Ok(Mutex::new(BufWriter::new(file)))
        };

        std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
            })
            .to_string(),
        )
        .with_context(|| "write manifest")?;

        Ok(Self {
            run_id,
            min_level: Level::from_env(),
            seq: AtomicU64::new(0),
            events: open("events.jsonl")?,
            trades: open("trades.jsonl")?,
            snapshots: open("snapshots.jsonl")?,
            mirror_stdout: true,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn quiet(mut self) -> Self {
        self.mirror_stdout = false;
        self
    }

    fn render(&self, level: Level, domain: Domain, event: &str, fields: Map<String, Value>) -> String {
        let mut entry = Map::new();
        entry.insert("ts".to_string(), json!(ts_now()));
        entry.insert("run_id".to_string(), json!(self.run_id));
        entry.insert("seq".to_string(), json!(self.seq.fetch_add(1, Ordering::SeqCst)));
        entry.insert("lvl".to_string(), json!(level.as_str()));
        entry.insert("domain".to_string(), json!(domain.as_str()));
        entry.insert("event".to_string(), json!(event));
        entry.insert("data".to_string(), Value::Object(fields));
        Value::Object(entry).to_string()
    }

    fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

impl EventLog for JsonlLogger {
    fn emit(&self, level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
        if level < self.min_level {
            return;
        }
        let line = self.render(level, domain, event, fields);
        Self::write_line(&self.events, &line);
        if self.mirror_stdout {
            println!("{}", line);
        }
    }

    fn trade(&self, fields: Map<String, Value>) {
        let line = self.render(Level::Info, Domain::Fill, "trade", fields);
        Self::write_line(&self.trades, &line);
        Self::write_line(&self.events, &line);
        if self.mirror_stdout {
            println!("{}", line);
        }
    }

    fn snapshot(&self, fields: Map<String, Value>) {
        let line = self.render(Level::Info, Domain::System, "snapshot", fields);
        Self::write_line(&self.snapshots, &line);
        if self.mirror_stdout {
            println!("{}", line);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
    }

    #[test]
    fn obj_helper_builds_maps() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn jsonl_logger_writes_streams() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = JsonlLogger::create(dir.path()).expect("logger").quiet();
        logger.emit(
            Level::Info,
            Domain::Risk,
            "gate",
            obj(&[("result", v_str("clear"))]),
        );
        logger.trade(obj(&[("symbol", v_str("ABC")), ("pnl", v_num(12.5))]));
        logger.snapshot(obj(&[("tick", v_num(5.0))]));

        let run_dir = dir.path().join(logger.run_id());
        let events = std::fs::read_to_string(run_dir.join("events.jsonl")).expect("events");
        // The trade is mirrored into the event stream.
        assert_eq!(events.lines().count(), 2);
        assert!(events.contains("\"event\":\"gate\""));

        let trades = std::fs::read_to_string(run_dir.join("trades.jsonl")).expect("trades");
        assert_eq!(trades.lines().count(), 1);
        assert!(trades.contains("\"symbol\":\"ABC\""));

        let snaps = std::fs::read_to_string(run_dir.join("snapshots.jsonl")).expect("snaps");
        assert!(snaps.contains("\"event\":\"snapshot\""));

        // Lines parse back and carry increasing sequence numbers.
        let seqs: Vec<u64> = events
            .lines()
            .map(|l| {
                serde_json::from_str::<Value>(l).expect("json")["seq"]
                    .as_u64()
                    .expect("seq")
            })
            .collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn min_level_filters_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut logger = JsonlLogger::create(dir.path()).expect("logger").quiet();
        logger.min_level = Level::Warn;
        logger.emit(Level::Debug, Domain::Market, "ignored", Map::new());
        logger.emit(Level::Error, Domain::Market, "kept", Map::new());
        let run_dir = dir.path().join(logger.run_id());
        let events = std::fs::read_to_string(run_dir.join("events.jsonl")).expect("events");
        assert_eq!(events.lines().count(), 1);
        assert!(events.contains("kept"));
    }
}
