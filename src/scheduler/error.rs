//! Error types for the scheduler module

use std::fmt;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// Timezone is not a known IANA zone
    InvalidTimezone {
        tz: String,
    },

    /// Frequency has no date calculation rule
    UnsupportedFrequency {
        frequency: String,
    },

    /// Input rejected before persistence
    Validation {
        field: String,
        reason: String,
    },

    /// Lifecycle action not allowed from the current status
    InvalidTransition {
        series_id: String,
        from: String,
        action: String,
    },

    /// Series does not exist
    SeriesNotFound {
        id: String,
    },

    /// Calendar arithmetic produced no representable date
    DateOutOfRange {
        reason: String,
    },

    /// Document executor rejected or failed the work item
    DispatchFailed {
        series_id: String,
        reason: String,
    },

    /// Document executor did not answer in time
    DispatchTimeout {
        series_id: String,
        timeout_secs: u64,
    },

    /// Upcoming-notification delivery failed
    NotificationFailed {
        reason: String,
    },

    /// Serialization/deserialization error
    SerializationError {
        reason: String,
    },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTimezone { tz } => {
                write!(f, "Invalid timezone: {}", tz)
            }
            Self::UnsupportedFrequency { frequency } => {
                write!(
                    f,
                    "Frequency '{}' has no date calculation rule",
                    frequency
                )
            }
            Self::Validation { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
            Self::InvalidTransition {
                series_id,
                from,
                action,
            } => {
                write!(
                    f,
                    "Cannot {} series {} while it is {}",
                    action, series_id, from
                )
            }
            Self::SeriesNotFound { id } => {
                write!(f, "Series not found: {}", id)
            }
            Self::DateOutOfRange { reason } => {
                write!(f, "Date out of range: {}", reason)
            }
            Self::DispatchFailed { series_id, reason } => {
                write!(f, "Dispatch failed for series {}: {}", series_id, reason)
            }
            Self::DispatchTimeout {
                series_id,
                timeout_secs,
            } => {
                write!(
                    f,
                    "Dispatch for series {} timed out after {}s",
                    series_id, timeout_secs
                )
            }
            Self::NotificationFailed { reason } => {
                write!(f, "Notification delivery failed: {}", reason)
            }
            Self::SerializationError { reason } => {
                write!(f, "Serialization error: {}", reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            reason: err.to_string(),
        }
    }
}

impl SchedulerError {
    /// Create an invalid timezone error
    pub fn invalid_timezone(tz: impl Into<String>) -> Self {
        Self::InvalidTimezone { tz: tz.into() }
    }

    /// Create an unsupported frequency error
    pub fn unsupported_frequency(frequency: impl Into<String>) -> Self {
        Self::UnsupportedFrequency {
            frequency: frequency.into(),
        }
    }

    /// Create a validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid transition error
    pub fn invalid_transition(
        series_id: impl Into<String>,
        from: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            series_id: series_id.into(),
            from: from.into(),
            action: action.into(),
        }
    }

    /// Create a series not found error
    pub fn series_not_found(id: impl Into<String>) -> Self {
        Self::SeriesNotFound { id: id.into() }
    }

    /// Create a date out of range error
    pub fn date_out_of_range(reason: impl Into<String>) -> Self {
        Self::DateOutOfRange {
            reason: reason.into(),
        }
    }

    /// Create a dispatch failure
    pub fn dispatch_failed(series_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DispatchFailed {
            series_id: series_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a notification failure
    pub fn notification_failed(reason: impl Into<String>) -> Self {
        Self::NotificationFailed {
            reason: reason.into(),
        }
    }

    /// Check if the error is recoverable
    ///
    /// Recoverable errors are retried on the next tick.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DispatchFailed { .. }
                | Self::DispatchTimeout { .. }
                | Self::NotificationFailed { .. }
        )
    }

    /// Whether the error was caused by caller input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::InvalidTimezone { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_timezone_error() {
        let err = SchedulerError::invalid_timezone("Mars/Olympus");
        assert!(err.to_string().contains("Mars/Olympus"));
        assert!(err.is_validation());
    }

    #[test]
    fn test_invalid_transition_error() {
        let err = SchedulerError::invalid_transition("s-1", "canceled", "resume");
        let msg = err.to_string();
        assert!(msg.contains("resume"));
        assert!(msg.contains("canceled"));
        assert!(msg.contains("s-1"));
    }

    #[test]
    fn test_unsupported_frequency_error() {
        let err = SchedulerError::unsupported_frequency("biweekly");
        assert!(err.to_string().contains("biweekly"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_is_recoverable() {
        let dispatch = SchedulerError::dispatch_failed("s-1", "renderer offline");
        assert!(dispatch.is_recoverable());

        let timeout = SchedulerError::DispatchTimeout {
            series_id: "s-1".to_string(),
            timeout_secs: 30,
        };
        assert!(timeout.is_recoverable());

        let invalid = SchedulerError::validation("frequency_day", "must be 0-6");
        assert!(!invalid.is_recoverable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let scheduler_err: SchedulerError = json_err.into();
        assert!(matches!(
            scheduler_err,
            SchedulerError::SerializationError { .. }
        ));
    }
}
