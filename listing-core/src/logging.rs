//! src/logging.rs
//! ============================================================================
//! # Logging: Tracing Initialization for the Listing Engine
//!
//! Sets up a `tracing-subscriber` registry with an env-filter and a
//! non-blocking rolling file appender. The returned [`Logger`] owns the
//! appender's worker guard; dropping it flushes remaining log lines.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogRotation {
    Never,
    Daily,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    pub log_dir: PathBuf,
    pub log_file_prefix: String,
    pub log_level: String,
    pub rotation: LogRotation,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: String::from("listing"),
            log_level: String::from("info"),
            rotation: LogRotation::Daily,
        }
    }
}

/// Holds the non-blocking writer guard for the lifetime of the process.
pub struct Logger {
    _guard: WorkerGuard,
}

impl Logger {
    /// Initialize the global subscriber. Call once at startup; subsequent
    /// calls fail because the global dispatcher is already set.
    pub fn init(config: &LoggerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("creating log directory {}", config.log_dir.display()))?;

        let rotation = match config.rotation {
            LogRotation::Never => Rotation::NEVER,
            LogRotation::Daily => Rotation::DAILY,
        };

        let appender =
            RollingFileAppender::new(rotation, &config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.log_level))
            .context("invalid log level directive")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true),
            )
            .try_init()
            .map_err(|e| anyhow::anyhow!("subscriber already set: {e}"))?;

        Ok(Self { _guard: guard })
    }
}
