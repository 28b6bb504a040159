//! Unified error handling for the recur crate
//!
//! This module provides a unified error type that wraps the scheduler's
//! domain errors together with storage, serialization and configuration
//! failures.
//!
//! # Architecture
//!
//! - [`RecurErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use recur::error::{Error, ErrorCategory, RecurErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(error = %err, "Will retry on next tick");
//!     } else {
//!         tracing::error!(category = ?err.category(), error = %err, "Giving up");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::scheduler::error::SchedulerError;

/// Common trait for all recur error types
pub trait RecurErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Rejected input (bad frequency parameters, end conditions, timezone)
    Validation,
    /// Scheduling and lifecycle errors
    Scheduler,
    /// Document or notification dispatch errors
    Dispatch,
    /// Storage and I/O errors
    Storage,
    /// Serialization errors
    Parsing,
    /// Configuration errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Short label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Scheduler => "scheduler",
            Self::Dispatch => "dispatch",
            Self::Storage => "storage",
            Self::Parsing => "parsing",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

impl RecurErrorTrait for SchedulerError {
    fn is_recoverable(&self) -> bool {
        SchedulerError::is_recoverable(self)
    }

    fn category(&self) -> ErrorCategory {
        match self {
            SchedulerError::Validation { .. } | SchedulerError::InvalidTimezone { .. } => {
                ErrorCategory::Validation
            }
            SchedulerError::DispatchFailed { .. }
            | SchedulerError::DispatchTimeout { .. }
            | SchedulerError::NotificationFailed { .. } => ErrorCategory::Dispatch,
            SchedulerError::SerializationError { .. } => ErrorCategory::Parsing,
            _ => ErrorCategory::Scheduler,
        }
    }
}

/// Unified error type for the recur crate
#[derive(Error, Debug)]
pub enum Error {
    /// Scheduler, calendar and lifecycle errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// Stored row could not be decoded
    #[error("Corrupt record in {table}: {reason}")]
    CorruptRecord { table: String, reason: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl RecurErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Database(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            Self::CorruptRecord { .. } => false,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Scheduler(e) => e.category(),
            Self::Database(_) | Self::CorruptRecord { .. } | Self::Io(_) => ErrorCategory::Storage,
            Self::Json(_) => ErrorCategory::Parsing,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a corrupt record error
    pub fn corrupt(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Borrow the scheduler error, if this is one
    pub fn as_scheduler(&self) -> Option<&SchedulerError> {
        match self {
            Self::Scheduler(e) => Some(e),
            _ => None,
        }
    }
}

// Conversion from rusqlite::Error
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err)
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
