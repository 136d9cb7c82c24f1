//! Runtime configuration.
//!
//! Loaded from defaults, `QUEUEFORGE_*` environment variables, or a YAML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

use crate::error::{QueueError, Result};

pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Concurrent executors in the worker pool.
    pub worker_count: usize,
    /// Routes this process consumes; empty means route-less messages only.
    pub routes: Vec<String>,
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    /// Local lease renewal interval. Must be below `heartbeat_timeout_ms`.
    pub heartbeat_interval_ms: u64,
    /// Age after which a lease counts as expired.
    pub heartbeat_timeout_ms: u64,
    pub recovery_scan_interval_ms: u64,
    /// Lease expiries tolerated before a message is moved to `Error`.
    pub max_retries: u32,
    pub expired_purge_interval_ms: u64,
    pub scheduler_tick_ms: u64,
    pub event_buffer_size: usize,
    pub db_path: String,
    pub log_level: String,
    /// Directory for the daily NDJSON log file; console only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            routes: Vec::new(),
            poll_interval_ms: 500,
            max_poll_interval_ms: 5_000,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            recovery_scan_interval_ms: 30_000,
            max_retries: DEFAULT_MAX_RETRIES,
            expired_purge_interval_ms: 60_000,
            scheduler_tick_ms: 1_000,
            event_buffer_size: 256,
            db_path: "queueforge.db".to_string(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl QueueConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            worker_count: env_or("QUEUEFORGE_WORKER_COUNT", d.worker_count),
            routes: std::env::var("QUEUEFORGE_ROUTES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|r| !r.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            poll_interval_ms: env_or("QUEUEFORGE_POLL_INTERVAL_MS", d.poll_interval_ms),
            max_poll_interval_ms: env_or("QUEUEFORGE_MAX_POLL_INTERVAL_MS", d.max_poll_interval_ms),
            heartbeat_interval_ms: env_or("QUEUEFORGE_HEARTBEAT_INTERVAL_MS", d.heartbeat_interval_ms),
            heartbeat_timeout_ms: env_or("QUEUEFORGE_HEARTBEAT_TIMEOUT_MS", d.heartbeat_timeout_ms),
            recovery_scan_interval_ms: env_or(
                "QUEUEFORGE_RECOVERY_SCAN_INTERVAL_MS",
                d.recovery_scan_interval_ms,
            ),
            max_retries: env_or("QUEUEFORGE_MAX_RETRIES", d.max_retries),
            expired_purge_interval_ms: env_or(
                "QUEUEFORGE_EXPIRED_PURGE_INTERVAL_MS",
                d.expired_purge_interval_ms,
            ),
            scheduler_tick_ms: env_or("QUEUEFORGE_SCHEDULER_TICK_MS", d.scheduler_tick_ms),
            event_buffer_size: env_or("QUEUEFORGE_EVENT_BUFFER_SIZE", d.event_buffer_size),
            db_path: std::env::var("QUEUEFORGE_DB").unwrap_or(d.db_path),
            log_level: std::env::var("RUST_LOG").unwrap_or(d.log_level),
            log_dir: std::env::var_os("QUEUEFORGE_LOG_DIR").map(PathBuf::from),
        }
    }

    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("Failed to parse queue config YAML")?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(QueueError::ConfigError("workerCount must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(QueueError::ConfigError("maxRetries must be at least 1".into()));
        }
        if self.heartbeat_interval_ms >= self.heartbeat_timeout_ms {
            return Err(QueueError::ConfigError(format!(
                "heartbeatIntervalMs ({}) must be below heartbeatTimeoutMs ({})",
                self.heartbeat_interval_ms, self.heartbeat_timeout_ms
            )));
        }
        if self.heartbeat_interval_ms * 2 > self.heartbeat_timeout_ms {
            warn!(
                interval_ms = self.heartbeat_interval_ms,
                timeout_ms = self.heartbeat_timeout_ms,
                "Heartbeat interval exceeds half the timeout; one missed tick may expire leases"
            );
        }
        if self.event_buffer_size == 0 {
            return Err(QueueError::ConfigError("eventBufferSize must be at least 1".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn recovery_scan_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_scan_interval_ms)
    }

    pub fn expired_purge_interval(&self) -> Duration {
        Duration::from_millis(self.expired_purge_interval_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }
}
