//! Structured logging for the ingestion pipeline.
//!
//! Every record is one JSON line carrying a run id, a process-wide sequence number, a level
//! and a domain. Lines go to stderr and to a per-run directory:
//!
//! - `events.jsonl`: INFO and above
//! - `trace.jsonl`: TRACE and DEBUG
//! - `manifest.json`: run id, pid, start time
//!
//! `LOG_LEVEL` sets the minimum level, `LOG_DOMAINS` (comma-separated or `all`) filters domains,
//! `LOG_DIR` moves the run directory root and `RUN_ID` pins the run id.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
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
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Ingest,    // Batch lifecycle
    Normalize, // Raw record parsing
    Reconcile, // Duplicates, corrections
    Session,   // Game open/close, orphans
    Store,     // Schema, transactions
    Derive,    // Metric derivation
    Fetch,     // Log producers
    System,    // Startup, shutdown
    Profile,   // Timing
    Audit,     // Digests for rerun verification
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Ingest => "ingest",
            Domain::Normalize => "normalize",
            Domain::Reconcile => "reconcile",
            Domain::Session => "session",
            Domain::Store => "store",
            Domain::Derive => "derive",
            Domain::Fetch => "fetch",
            Domain::System => "system",
            Domain::Profile => "profile",
            Domain::Audit => "audit",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Sequence counter and run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }

        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        let open = |name: &str| match File::create(run_dir.join(name)) {
            Ok(f) => Some(Mutex::new(BufWriter::new(f))),
            Err(err) => {
                eprintln!("[log] failed to create {}: {}", name, err);
                None
            }
        };

        RunContext {
            events: open("events.jsonl"),
            trace: open("trace.jsonl"),
            run_id,
        }
    })
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["game_key", "server", "player_id", "fingerprint", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

pub fn run_id() -> String {
    ensure_run_context().run_id.clone()
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    eprintln!("{}", line);
}

// =============================================================================
// Pipeline helpers
// =============================================================================

pub fn log_malformed(index: usize, reason: &str, aborting: bool) {
    log(
        if aborting { Level::Error } else { Level::Warn },
        Domain::Normalize,
        "malformed_record",
        obj(&[
            ("index", json!(index)),
            ("reason", v_str(reason)),
            ("policy", v_str(if aborting { "abort" } else { "skip" })),
        ]),
    );
}

pub fn log_correction(fingerprint: &str, replaced: Option<i64>, game_key: Option<&str>) {
    log(
        Level::Info,
        Domain::Reconcile,
        "correction",
        obj(&[
            ("fingerprint", v_str(fingerprint)),
            ("replaced_event", replaced.map(|id| json!(id)).unwrap_or(Value::Null)),
            ("game_key", game_key.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_game_opened(game_key: &str, server: &str, start_ms: i64, map: Option<&str>) {
    log(
        Level::Info,
        Domain::Session,
        "game_opened",
        obj(&[
            ("game_key", v_str(game_key)),
            ("server", v_str(server)),
            ("start_ms", json!(start_ms)),
            ("map", map.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_game_closed(game_key: &str, end_ms: i64, truncated: bool, reason: &str) {
    log(
        if truncated { Level::Warn } else { Level::Info },
        Domain::Session,
        "game_closed",
        obj(&[
            ("game_key", v_str(game_key)),
            ("end_ms", json!(end_ms)),
            ("truncated", json!(truncated)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_orphan(fingerprint: &str, server: &str, at_ms: i64) {
    log(
        Level::Warn,
        Domain::Session,
        "orphan_event",
        obj(&[
            ("fingerprint", v_str(fingerprint)),
            ("server", v_str(server)),
            ("at_ms", json!(at_ms)),
            ("msg", v_str("held pending until a game boundary is available")),
        ]),
    );
}

/// Log a derivation digest so reruns can be compared record by record.
pub fn log_audit(game_key: &str, version: u32, input_digest: &str, rows: usize) {
    log(
        Level::Info,
        Domain::Audit,
        "analysis_replaced",
        obj(&[
            ("game_key", v_str(game_key)),
            ("version", json!(version)),
            ("input_digest", v_str(input_digest)),
            ("rows", json!(rows)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

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
// Profiling Scope
// =============================================================================

/// Emits a TRACE `profile` record with the elapsed time when dropped.
pub struct ProfileScope {
    label: &'static str,
    context: Map<String, Value>,
    started: Instant,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self::with_context(label, &[])
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        Self {
            label,
            context: obj(fields),
            started: Instant::now(),
        }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = std::mem::take(&mut self.context);
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_split_fields_lifts_keys() {
        let (top, data) = split_fields(obj(&[
            ("game_key", v_str("1_4")),
            ("rows", json!(3)),
        ]));
        assert!(top.contains_key("game_key"));
        assert!(data.contains_key("rows"));
        assert!(!data.contains_key("game_key"));
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
