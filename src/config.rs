use std::path::PathBuf;
use std::time::Duration;

use crate::logging::{Level, LogConfig};
use crate::peer::retry::RetryConfig;
use crate::reconcile::{EligibilityPolicy, ReconcilerConfig};
use crate::risk::DrawdownConfig;
use crate::types::Identity;

/// Node settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    // Peer polling
    pub max_attempts: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_jitter: f64,
    pub refresh_interval_secs: u64,
    pub peer_timeout_ms: u64,
    pub high_trust_threshold: f64,
    pub min_peer_trust: f64,
    /// Testnet mode: any member with an address is queryable.
    pub open_peer_access: bool,
    pub high_leverage_threshold: f64,

    // Drawdown limits
    pub max_daily_drawdown: f64,
    pub max_total_drawdown: f64,
    pub daily_window_minutes: u32,

    // Storage
    pub data_dir: PathBuf,
    pub registry_path: PathBuf,
    pub blocklist_path: PathBuf,
    pub self_identity: Option<Identity>,
    pub cache_refresh_secs: u64,

    // Logging
    pub log_dir: PathBuf,
    pub log_level: Level,
    pub run_id: Option<String>,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        Self {
            max_attempts: std::env::var("MAX_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(1),
            initial_retry_delay_ms: std::env::var("INITIAL_RETRY_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(3_000),
            max_retry_delay_ms: std::env::var("MAX_RETRY_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(60_000),
            retry_jitter: std::env::var("RETRY_JITTER").ok().and_then(|v| v.parse().ok()).unwrap_or(0.0),
            refresh_interval_secs: std::env::var("REFRESH_INTERVAL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(300),
            peer_timeout_ms: std::env::var("PEER_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(12_000),
            high_trust_threshold: std::env::var("HIGH_TRUST_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(0.5),
            min_peer_trust: std::env::var("MIN_PEER_TRUST").ok().and_then(|v| v.parse().ok()).unwrap_or(0.0),
            open_peer_access: std::env::var("OPEN_PEER_ACCESS").map(|v| v == "1" || v == "true").unwrap_or(false),
            high_leverage_threshold: std::env::var("HIGH_LEVERAGE_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(10.0),
            max_daily_drawdown: std::env::var("MAX_DAILY_DRAWDOWN").ok().and_then(|v| v.parse().ok()).unwrap_or(0.95),
            max_total_drawdown: std::env::var("MAX_TOTAL_DRAWDOWN").ok().and_then(|v| v.parse().ok()).unwrap_or(0.90),
            daily_window_minutes: std::env::var("DAILY_WINDOW_MINUTES").ok().and_then(|v| v.parse().ok()).unwrap_or(5),
            data_dir: std::env::var("DATA_DIR").unwrap_or_else(|_| "./validation".to_string()).into(),
            registry_path: std::env::var("REGISTRY_PATH").unwrap_or_else(|_| "./registry.json".to_string()).into(),
            blocklist_path: std::env::var("BLOCKLIST_PATH").unwrap_or_else(|_| "./plagiarism_blocklist.json".to_string()).into(),
            self_identity: std::env::var("SELF_IDENTITY").ok().filter(|v| !v.is_empty()).map(Identity::new),
            cache_refresh_secs: std::env::var("CACHE_REFRESH_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(300),
            log_dir: std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string()).into(),
            log_level: std::env::var("LOG_LEVEL").map(|v| Level::parse(&v)).unwrap_or(Level::Info),
            run_id: std::env::var("RUN_ID").ok().filter(|v| !v.is_empty()),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            jitter_factor: self.retry_jitter,
        }
    }

    pub fn eligibility_policy(&self) -> EligibilityPolicy {
        EligibilityPolicy {
            min_trust: self.min_peer_trust,
            open_access: self.open_peer_access,
            self_identity: self.self_identity.clone(),
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            retry: self.retry_config(),
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            peer_timeout: Duration::from_millis(self.peer_timeout_ms),
            high_trust_threshold: self.high_trust_threshold,
            high_leverage_threshold: self.high_leverage_threshold,
            eligibility: self.eligibility_policy(),
        }
    }

    pub fn drawdown_config(&self) -> DrawdownConfig {
        DrawdownConfig {
            max_daily_drawdown: self.max_daily_drawdown,
            max_total_drawdown: self.max_total_drawdown,
            daily_window_minutes: self.daily_window_minutes,
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            min_level: self.log_level,
            log_dir: Some(self.log_dir.clone()),
            run_id: self.run_id.clone(),
            stdout: true,
        }
    }

    pub fn cache_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cache_refresh_secs)
    }
}
