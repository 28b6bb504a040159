//! recur - Recurring billing document scheduler
//!
//! Decides when each recurring series must produce its next document,
//! generates it exactly once per cycle, and keeps the series' lifecycle and
//! forecasts up to date.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Series, documents and their enums
//! - [`scheduler`] - Date calculation, lifecycle, generation and forecasting
//! - [`storage`] - SQLite persistence behind a repository trait
//! - [`metrics`] - Prometheus metrics
//! - [`error`] - Unified error type
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use recur::config::Config;
//! use recur::scheduler::{LogExecutor, LogNotifier, SchedulerTrigger};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let repo = recur::storage::open_repository(&config.database)?;
//!     let trigger = SchedulerTrigger::new(
//!         repo,
//!         Arc::new(LogExecutor),
//!         Arc::new(LogNotifier),
//!         config.scheduler.clone(),
//!     );
//!     // trigger.start().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod scheduler;
pub mod storage;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, RecurErrorTrait, Result};
    pub use crate::models::{
        DocumentStatus, EndCondition, EndType, Frequency, GeneratedDocument, RecurringSeries,
        SeriesDraft, SeriesPatch, SeriesStatus,
    };
    pub use crate::scheduler::{
        GenerationEngine, LifecycleManager, SchedulerError, SchedulerEvent, SchedulerTrigger,
    };
    pub use crate::storage::{SeriesFilter, SeriesRepository, SharedSeriesRepository};
}

// Direct re-exports for convenience
pub use models::{Frequency, RecurringSeries, SeriesStatus};
