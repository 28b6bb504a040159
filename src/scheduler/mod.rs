//! Recurring document scheduling engine
//!
//! This module decides when each recurring series fires, generates exactly
//! one document per cycle, moves series through their lifecycle and projects
//! future occurrences.
//!
//! # Overview
//!
//! The engine is driven by polling. Every tick scans for due series, claims
//! a document slot per (series, sequence), dispatches the work to an
//! external executor and advances or fails the series based on the answer.
//! Duplicate ticks and redelivered work are harmless because the storage
//! claim is the only source of truth for "already generated".
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      SchedulerTrigger                         │
//! │               (interval tick, event broadcast)                │
//! └───────────────┬──────────────────────────────┬────────────────┘
//!                 │                              │
//!          ┌──────▼───────┐               ┌──────▼───────┐
//!          │  Generation  │               │   Upcoming   │
//!          │    Engine    │               │ Notifications│
//!          └──┬────────┬──┘               └──────┬───────┘
//!             │        │                         │
//!      ┌──────▼──┐  ┌──▼──────────┐              │
//!      │ Scanner │  │  Executor   │              │
//!      └──────┬──┘  └─────────────┘              │
//!             │                                  │
//!      ┌──────▼──────────────────────────────────▼───────┐
//!      │                SeriesRepository                 │
//!      └─────────────────────────────────────────────────┘
//!
//!      Frequency calculator + calendar: pure, used by all of the above
//! ```
//!
//! # Modules
//!
//! - [`calendar`] - Local civil time, DST resolution and month arithmetic
//! - [`frequency`] - Next-date calculation, previews and end conditions
//! - [`lifecycle`] - Pause/resume/cancel state machine and series updates
//! - [`generation`] - Idempotent claim, dispatch and series advancement
//! - [`scanner`] - Due-series batch selection
//! - [`notify`] - Upcoming-due notification selection and delivery
//! - [`forecast`] - Multi-month amount projection
//! - [`trigger`] - Polling loop and scheduler events
//!
//! # Quick Start
//!
//! ```ignore
//! use recur::scheduler::{LifecycleManager, SchedulerTrigger, LogExecutor, LogNotifier};
//! use recur::models::{Frequency, SeriesDraft};
//!
//! let repo = recur::storage::create_sqlite_repository("data/recur.db")?;
//! let manager = LifecycleManager::new(repo.clone());
//!
//! let draft = SeriesDraft::new("team-1", "user-1", Frequency::MonthlyDate)
//!     .day(15)
//!     .timezone("Europe/Stockholm")
//!     .priced(1200.0, "SEK");
//! let series = manager.create(draft, chrono::Utc::now())?;
//!
//! let trigger = SchedulerTrigger::new(
//!     repo,
//!     Arc::new(LogExecutor),
//!     Arc::new(LogNotifier),
//!     config.scheduler.clone(),
//! );
//! trigger.start().await?;
//! ```
//!
//! # Configuration
//!
//! | Setting | Default | Description |
//! |---------|---------|-------------|
//! | `due_batch_size` | 50 | Due series handled per tick |
//! | `notification_batch_size` | 100 | Notices sent per tick |
//! | `lookahead_hours` | 24 | Upcoming notification window |
//! | `max_consecutive_failures` | 3 | Failures before auto-pause |
//! | `catch_up_max_iterations` | 1000 | Missed-cycle skip limit |

pub mod calendar;
pub mod error;
pub mod forecast;
pub mod frequency;
pub mod generation;
pub mod lifecycle;
pub mod notify;
pub mod scanner;
pub mod trigger;

// Re-export main types
pub use error::{SchedulerError, SchedulerResult};
pub use forecast::{max_occurrences, project_forecast, Forecast, MonthForecast};
pub use frequency::{
    advance_to_future, first_scheduled_date, is_completed, next_scheduled_date,
    upcoming_occurrences, validate_frequency_params, Advance, Occurrence, ScheduleParams,
    UpcomingSchedule, UpcomingSummary,
};
pub use generation::{
    on_generation_failure, on_generation_success, ChannelExecutor, DocumentExecutor,
    GenerationEngine, GenerationWorkItem, LogExecutor, SeriesOutcome, SkipReason, TickError,
    TickReport,
};
pub use lifecycle::{LifecycleManager, RecurringInfo};
pub use notify::{
    select_upcoming, send_upcoming_notifications, LogNotifier, Notifier, NotifyReport,
    UpcomingBatch, UpcomingDue,
};
pub use scanner::{scan_due, DueBatch};
pub use trigger::{CycleReport, SchedulerEvent, SchedulerTrigger, TriggerStatus};
