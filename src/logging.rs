//! Structured JSON-lines logging.
//!
//! Every record carries a run id, a sequence number, a level and a domain so
//! a run can be filtered and replayed after the fact:
//! - `LOG_LEVEL` sets the minimum level (default info)
//! - `LOG_DOMAINS` is a comma-separated allow list, or `all`
//! - `LOG_DIR` is where per-run directories go (`off` disables files)

use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::types::{RebalanceEvent, RegimeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for Level {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            _ => Err(()),
        }
    }
}

/// Which part of the pipeline a record comes from; `LOG_DOMAINS` filters on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Market,    // source attempts and fallbacks
    Regime,    // detections
    Rebalance, // transitions and allocations
    Storage,   // commits
    System,    // startup, bootstrap, failed cycles
    Audit,     // digests of appended trail entries
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Market => "market",
            Domain::Regime => "regime",
            Domain::Rebalance => "rebalance",
            Domain::Storage => "storage",
            Domain::System => "system",
            Domain::Audit => "audit",
        }
    }
}

/// Level and domain filters, read from the environment once.
struct Filter {
    min: Level,
    /// `None` lets every domain through.
    domains: Option<Vec<String>>,
}

impl Filter {
    fn from_env() -> Self {
        let min = std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Level::Info);
        let domains = match std::env::var("LOG_DOMAINS") {
            Ok(list) if list.trim() != "all" => {
                Some(list.split(',').map(|d| d.trim().to_string()).collect())
            }
            _ => None,
        };
        Self { min, domains }
    }

    fn allows(&self, level: Level, domain: Domain) -> bool {
        level >= self.min
            && self
                .domains
                .as_ref()
                .map_or(true, |list| list.iter().any(|d| d == domain.as_str()))
    }
}

type Sink = Mutex<BufWriter<File>>;

/// Per-run output: `events.jsonl` for info and above, `trace.jsonl` below.
struct Run {
    id: String,
    events: Option<Sink>,
    trace: Option<Sink>,
}

impl Run {
    fn start() -> Self {
        let id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        if base == "off" {
            return Self { id, events: None, trace: None };
        }

        let dir = PathBuf::from(base).join(&id);
        if let Err(err) = create_dir_all(&dir) {
            eprintln!("[log] cannot create {}: {}", dir.display(), err);
            return Self { id, events: None, trace: None };
        }
        let manifest = json!({
            "run_id": id,
            "started": ts_now(),
            "pid": process::id(),
            "version": env!("CARGO_PKG_VERSION"),
        });
        let _ = std::fs::write(dir.join("manifest.json"), manifest.to_string());

        Self {
            events: open_sink(&dir.join("events.jsonl")),
            trace: open_sink(&dir.join("trace.jsonl")),
            id,
        }
    }

    fn write(&self, level: Level, line: &str) {
        let sink = if level >= Level::Info { &self.events } else { &self.trace };
        if let Some(Ok(mut w)) = sink.as_ref().map(|s| s.lock()) {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

fn open_sink(path: &Path) -> Option<Sink> {
    File::create(path)
        .map(|f| Mutex::new(BufWriter::new(f)))
        .map_err(|err| eprintln!("[log] cannot create {}: {}", path.display(), err))
        .ok()
}

static SEQ: AtomicU64 = AtomicU64::new(0);
static FILTER: OnceLock<Filter> = OnceLock::new();
static RUN: OnceLock<Run> = OnceLock::new();

#[derive(Serialize)]
struct Record<'a> {
    ts: String,
    run_id: &'a str,
    seq: u64,
    lvl: Level,
    component: &'static str,
    event: &'a str,
    msg: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    account_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    symbol: Option<Value>,
    data: Map<String, Value>,
}

const SECRET_KEYS: [&str; 3] = ["authorization", "api_key", "x-cg-demo-api-key"];

fn redact(mut fields: Map<String, Value>) -> Map<String, Value> {
    for (key, value) in fields.iter_mut() {
        if SECRET_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
            *value = Value::String("[REDACTED]".to_string());
        }
    }
    fields
}

pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Emit one JSON line. `account_id`, `symbol` and `msg` are lifted out of
/// `fields` to the top level; everything else lands under `data`.
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if !FILTER.get_or_init(Filter::from_env).allows(level, domain) {
        return;
    }
    let run = RUN.get_or_init(Run::start);
    let mut data = redact(fields);
    let record = Record {
        ts: ts_now(),
        run_id: &run.id,
        seq: SEQ.fetch_add(1, Ordering::SeqCst),
        lvl: level,
        component: domain.as_str(),
        event,
        msg: data.remove("msg").unwrap_or_else(|| Value::String(String::new())),
        account_id: data.remove("account_id"),
        symbol: data.remove("symbol"),
        data,
    };
    let Ok(line) = serde_json::to_string(&record) else { return };
    run.write(level, &line);
    // stdout carries command results
    eprintln!("{}", line);
}

pub fn log_source_failure(symbol: &str, source_id: &str, error: &str, permanent: bool) {
    log(
        Level::Warn,
        Domain::Market,
        "source_failed",
        obj(&[
            ("symbol", v_str(symbol)),
            ("source", v_str(source_id)),
            ("error", v_str(error)),
            ("permanent", Value::Bool(permanent)),
        ]),
    );
}

/// Which source answered; a non-zero depth means a fallback was used.
pub fn log_source_answer(symbol: &str, source_id: &str, what: &str, fallback_depth: usize) {
    let level = if fallback_depth > 0 { Level::Info } else { Level::Debug };
    log(
        level,
        Domain::Market,
        if fallback_depth > 0 { "fallback_used" } else { "source_answered" },
        obj(&[
            ("symbol", v_str(symbol)),
            ("source", v_str(source_id)),
            ("what", v_str(what)),
            ("fallback_depth", json!(fallback_depth)),
        ]),
    );
}

pub fn log_regime(account_id: &str, state: &RegimeState) {
    log(
        Level::Info,
        Domain::Regime,
        "detected",
        obj(&[
            ("account_id", v_str(account_id)),
            ("level", json!(state.level())),
            ("regime", v_str(state.regime_name())),
            ("z_score", v_num(state.z_score)),
            ("current_vol", v_num(state.current_vol)),
            ("baseline_mean", v_num(state.baseline_mean)),
            ("baseline_std", v_num(state.baseline_std)),
            ("detected_by", v_str(state.detected_by.as_str())),
        ]),
    );
}

pub fn log_rebalance(account_id: &str, event: &RebalanceEvent) {
    log(
        Level::Info,
        Domain::Rebalance,
        event.action.as_str(),
        obj(&[
            ("account_id", v_str(account_id)),
            ("msg", v_str(&event.reasoning)),
            ("from", event.previous_regime.map(|r| v_str(r.name())).unwrap_or(Value::Null)),
            ("to", v_str(event.new_regime.name())),
            ("value_before", v_num(event.portfolio_value_before)),
            ("value_after", v_num(event.portfolio_value_after)),
        ]),
    );
    log_audit("rebalance_event", account_id, &event.digest);
}

/// Log an audit entry for replay verification
pub fn log_audit(event_type: &str, account_id: &str, digest: &str) {
    log(
        Level::Info,
        Domain::Audit,
        event_type,
        obj(&[("account_id", v_str(account_id)), ("digest", v_str(digest))]),
    );
}

pub fn log_cycle_failure(account_id: &str, operation: &str, error: &str) {
    log(
        Level::Error,
        Domain::System,
        "cycle_failed",
        obj(&[
            ("account_id", v_str(account_id)),
            ("operation", v_str(operation)),
            ("msg", v_str(error)),
        ]),
    );
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
