//! Structured logging.
//!
//! Every record is one JSON line with `ts`, `run_id`, `seq`, `lvl`, `domain`,
//! `event` and a `data` object. A [`Logger`] is a cheap cloneable handle that
//! components receive at construction; nothing in the crate logs through a
//! process-wide singleton.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

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
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "trace" => Level::Trace,
            "debug" => Level::Debug,
            "info" => Level::Info,
            "warn" | "warning" => Level::Warn,
            "error" => Level::Error,
            "fatal" => Level::Fatal,
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
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Peer,      // Per-peer query results, transport failures
    Reconcile, // Replica selection, desync and leverage diagnostics
    Risk,      // Drawdown classification, eliminations
    Store,     // Document reads and writes
    Cache,     // Membership filtering, overrides
    Registry,  // Roster refreshes
    System,    // Startup, shutdown
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Peer => "peer",
            Domain::Reconcile => "reconcile",
            Domain::Risk => "risk",
            Domain::Store => "store",
            Domain::Cache => "cache",
            Domain::Registry => "registry",
            Domain::System => "system",
        }
    }
}

/// One emitted log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub ts: String,
    pub run_id: String,
    pub seq: u64,
    pub lvl: Level,
    pub domain: Domain,
    pub event: String,
    pub data: Map<String, Value>,
}

// =============================================================================
// Logger handle
// =============================================================================

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub min_level: Level,
    pub log_dir: Option<PathBuf>,
    pub run_id: Option<String>,
    pub stdout: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            min_level: Level::Info,
            log_dir: None,
            run_id: None,
            stdout: true,
        }
    }
}

#[derive(Debug)]
struct Inner {
    run_id: String,
    min_level: Level,
    seq: AtomicU64,
    stdout: bool,
    events: Option<Mutex<BufWriter<File>>>,
    capture: Option<Mutex<Vec<LogRecord>>>,
}

#[derive(Debug, Clone)]
pub struct Logger {
    inner: Arc<Inner>,
}

impl Logger {
    /// Build a logger from configuration, creating `<log_dir>/<run_id>/` with a
    /// manifest and an `events.jsonl` file when a log dir is configured.
    pub fn from_config(cfg: &LogConfig) -> std::io::Result<Self> {
        let run_id = cfg
            .run_id
            .clone()
            .unwrap_or_else(|| format!("r-{}-{}", ts_epoch_ms(), process::id()));

        let events = match &cfg.log_dir {
            Some(base) => {
                let run_dir = base.join(&run_id);
                create_dir_all(&run_dir)?;
                std::fs::write(
                    run_dir.join("manifest.json"),
                    json!({
                        "run_id": run_id,
                        "ts": ts_now(),
                        "pid": process::id(),
                        "log_dir": run_dir.to_string_lossy(),
                    })
                    .to_string(),
                )?;
                let file = File::create(run_dir.join("events.jsonl"))?;
                Some(Mutex::new(BufWriter::new(file)))
            }
            None => None,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                run_id,
                min_level: cfg.min_level,
                seq: AtomicU64::new(0),
                stdout: cfg.stdout,
                events,
                capture: None,
            }),
        })
    }

    /// Logger that keeps every record in memory and writes nowhere.
    pub fn capture() -> Self {
        Self {
            inner: Arc::new(Inner {
                run_id: "capture".to_string(),
                min_level: Level::Trace,
                seq: AtomicU64::new(0),
                stdout: false,
                events: None,
                capture: Some(Mutex::new(Vec::new())),
            }),
        }
    }

    /// Logger that drops everything.
    pub fn discard() -> Self {
        Self {
            inner: Arc::new(Inner {
                run_id: "discard".to_string(),
                min_level: Level::Fatal,
                seq: AtomicU64::new(0),
                stdout: false,
                events: None,
                capture: None,
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn enabled(&self, level: Level) -> bool {
        level >= self.inner.min_level
    }

    /// Emit a structured log entry
    pub fn log(&self, level: Level, domain: Domain, event: &str, data: Map<String, Value>) {
        if !self.enabled(level) {
            return;
        }
        let record = LogRecord {
            ts: ts_now(),
            run_id: self.inner.run_id.clone(),
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
            lvl: level,
            domain,
            event: event.to_string(),
            data,
        };

        if self.inner.stdout || self.inner.events.is_some() {
            let line = serde_json::to_string(&record).unwrap_or_else(|_| "{}".to_string());
            if let Some(events) = &self.inner.events {
                if let Ok(mut w) = events.lock() {
                    let _ = writeln!(w, "{}", line);
                    let _ = w.flush();
                }
            }
            if self.inner.stdout {
                println!("{}", line);
            }
        }
        if let Some(capture) = &self.inner.capture {
            if let Ok(mut records) = capture.lock() {
                records.push(record);
            }
        }
    }

    /// Captured records (empty unless built with [`Logger::capture`]).
    pub fn records(&self) -> Vec<LogRecord> {
        self.inner
            .capture
            .as_ref()
            .and_then(|c| c.lock().ok().map(|r| r.clone()))
            .unwrap_or_default()
    }

    pub fn records_for(&self, event: &str) -> Vec<LogRecord> {
        self.records().into_iter().filter(|r| r.event == event).collect()
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
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
