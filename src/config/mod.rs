//! Configuration management for the recur scheduler
//!
//! This module handles loading and validating configuration from environment variables
//! and TOML files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::frequency::DEFAULT_CATCH_UP_ITERATIONS;
use crate::scheduler::notify::{DEFAULT_LOOKAHEAD_HOURS, DEFAULT_NOTIFICATION_BATCH_SIZE};
use crate::scheduler::scanner::DEFAULT_DUE_BATCH_SIZE;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Scheduler-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks
    pub tick_interval_secs: u64,

    /// Maximum due series processed per tick
    pub due_batch_size: usize,

    /// Maximum upcoming notifications per run
    pub notification_batch_size: usize,

    /// How far ahead upcoming notifications look
    pub lookahead_hours: u32,

    /// Consecutive failures before a series is paused
    pub max_consecutive_failures: u32,

    /// Cap for the missed-cycle catch-up loop
    pub catch_up_max_iterations: u32,

    /// Timeout for a single document dispatch
    pub dispatch_timeout_secs: u64,

    /// Dispatches running at the same time within a tick
    pub max_concurrent_dispatches: usize,

    /// Kill switch; when false ticks do nothing
    pub enabled: bool,

    /// Log what would be generated without claiming or dispatching
    pub dry_run: bool,
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = SchedulerConfig::default();

        let scheduler = SchedulerConfig {
            tick_interval_secs: env_parse("RECUR_TICK_INTERVAL_SECS")
                .unwrap_or(defaults.tick_interval_secs),
            due_batch_size: env_parse("RECUR_DUE_BATCH_SIZE").unwrap_or(defaults.due_batch_size),
            notification_batch_size: env_parse("RECUR_NOTIFICATION_BATCH_SIZE")
                .unwrap_or(defaults.notification_batch_size),
            lookahead_hours: env_parse("RECUR_LOOKAHEAD_HOURS").unwrap_or(defaults.lookahead_hours),
            max_consecutive_failures: env_parse("RECUR_MAX_CONSECUTIVE_FAILURES")
                .unwrap_or(defaults.max_consecutive_failures),
            catch_up_max_iterations: env_parse("RECUR_CATCH_UP_MAX_ITERATIONS")
                .unwrap_or(defaults.catch_up_max_iterations),
            dispatch_timeout_secs: env_parse("RECUR_DISPATCH_TIMEOUT_SECS")
                .unwrap_or(defaults.dispatch_timeout_secs),
            max_concurrent_dispatches: env_parse("RECUR_MAX_CONCURRENT_DISPATCHES")
                .unwrap_or(defaults.max_concurrent_dispatches),
            enabled: env_parse("RECUR_ENABLED").unwrap_or(defaults.enabled),
            dry_run: env_parse("RECUR_DRY_RUN").unwrap_or(defaults.dry_run),
        };

        let sqlite_path = std::env::var("RECUR_SQLITE_PATH")
            .unwrap_or_else(|_| String::from("data/recur.db"))
            .into();

        let log_level = std::env::var("RECUR_LOG_LEVEL").unwrap_or_else(|_| String::from("info"));

        let log_format = std::env::var("RECUR_LOG_FORMAT").unwrap_or_else(|_| String::from("text"));

        Ok(Self {
            scheduler,
            database: DatabaseConfig { sqlite_path },
            logging: LoggingConfig {
                level: log_level,
                format: log_format,
            },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;

        if s.tick_interval_secs == 0 {
            anyhow::bail!("tick_interval_secs must be greater than 0");
        }

        if s.due_batch_size == 0 {
            anyhow::bail!("due_batch_size must be greater than 0");
        }

        if s.notification_batch_size == 0 {
            anyhow::bail!("notification_batch_size must be greater than 0");
        }

        if s.max_consecutive_failures == 0 {
            anyhow::bail!("max_consecutive_failures must be greater than 0");
        }

        if s.catch_up_max_iterations == 0 {
            anyhow::bail!("catch_up_max_iterations must be greater than 0");
        }

        if s.dispatch_timeout_secs == 0 {
            anyhow::bail!("dispatch_timeout_secs must be greater than 0");
        }

        if s.max_concurrent_dispatches == 0 {
            anyhow::bail!("max_concurrent_dispatches must be greater than 0");
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging.format must be 'text' or 'json'");
        }

        Ok(())
    }

    /// Get tick interval as Duration
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.tick_interval_secs)
    }

    /// Get dispatch timeout as Duration
    #[must_use]
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.dispatch_timeout_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            due_batch_size: DEFAULT_DUE_BATCH_SIZE,
            notification_batch_size: DEFAULT_NOTIFICATION_BATCH_SIZE,
            lookahead_hours: DEFAULT_LOOKAHEAD_HOURS,
            max_consecutive_failures: 3,
            catch_up_max_iterations: DEFAULT_CATCH_UP_ITERATIONS,
            dispatch_timeout_secs: 30,
            max_concurrent_dispatches: 8,
            enabled: true,
            dry_run: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/recur.db"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}
