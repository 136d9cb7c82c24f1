//! Process-wide `tracing` setup.
//!
//! Compact human-readable lines on stdout, plus a daily NDJSON file when a
//! log directory is configured. `RUST_LOG` overrides the configured level.

use std::io;
use std::path::Path;

use tracing::warn;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use queueforge_core::QueueConfig;

/// Files are named `queueforge.log.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "queueforge.log";
const FALLBACK_LEVEL: &str = "info";

fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(FALLBACK_LEVEL))
}

/// Install the global subscriber. Returns `false` if one was already set.
///
/// An unusable `log_dir` drops the file output with a warning instead of
/// failing start-up.
pub fn init_logger(level: &str, log_dir: Option<&Path>) -> bool {
    let mut dir_error = None;
    let file_layer = log_dir.and_then(|dir| match std::fs::create_dir_all(dir) {
        Ok(()) => Some(
            fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_span_list(false)
                .with_ansi(false)
                .with_writer(rolling::daily(dir, LOG_FILE_PREFIX)),
        ),
        Err(e) => {
            dir_error = Some((dir.to_path_buf(), e));
            None
        }
    });

    let console_layer = fmt::layer()
        .compact()
        .with_writer(io::stdout)
        .with_target(true);

    let installed = tracing_subscriber::registry()
        .with(filter_for(level))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if let Some((dir, e)) = dir_error {
        warn!(dir = %dir.display(), error = %e, "Log directory unavailable; logging to console only");
    }
    installed
}

/// Level from `logLevel`, file output only when `logDir` is set.
pub fn init_from_config(config: &QueueConfig) -> bool {
    init_logger(&config.log_level, config.log_dir.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installs_once_and_creates_log_dir() {
        let dir = std::env::temp_dir().join(format!("queueforge-log-{}", std::process::id()));
        let config = QueueConfig {
            log_level: "debug".into(),
            log_dir: Some(dir.join("nested")),
            ..Default::default()
        };

        assert!(init_from_config(&config));
        assert!(dir.join("nested").is_dir());
        assert!(!init_logger("info", None));
        tracing::info!(component = "logging-test", "Logger initialized");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
