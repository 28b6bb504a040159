//! Series lifecycle state machine
//!
//! ```text
//!            pause              resume (end not reached)
//!   ┌────────┐ ───────► ┌────────┐ ───────► ┌────────┐
//!   │ active │          │ paused │          │ active │
//!   └────────┘ ◄─────── └────────┘          └────────┘
//!      │  │    resume       │  │
//!      │  │                 │  └── resume (end reached) ──► completed
//!      │  └── success, end reached ─────────────────────────► completed
//!      └───────────── cancel (from active or paused) ───────► canceled
//! ```
//!
//! Completed and canceled are terminal. The transitions are pure functions
//! over [`RecurringSeries`]; [`LifecycleManager`] applies them through the
//! repository's atomic `modify_series`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::calendar::parse_timezone;
use super::error::{SchedulerError, SchedulerResult};
use super::frequency::{
    is_completed, next_scheduled_date, upcoming_occurrences, validate_frequency_params,
    UpcomingSchedule,
};
use crate::error::Result;
use crate::metrics;
use crate::models::{
    EndType, RecurringSeries, SeriesDraft, SeriesPatch, SeriesStatus,
};
use crate::storage::{SeriesFilter, SeriesRepository};

/// Preview length when the caller does not ask for one
pub const DEFAULT_UPCOMING_LIMIT: usize = 10;

/// Currency reported for series without one
pub const DEFAULT_CURRENCY: &str = "USD";

// ============================================================================
// Pure Transitions
// ============================================================================

/// Pause an active series; `next_scheduled_at` is kept as-is
pub fn pause(series: &RecurringSeries, now: DateTime<Utc>) -> SchedulerResult<RecurringSeries> {
    if series.status != SeriesStatus::Active {
        return Err(SchedulerError::invalid_transition(
            &series.id,
            series.status.as_str(),
            "pause",
        ));
    }

    let mut paused = series.clone();
    paused.status = SeriesStatus::Paused;
    paused.updated_at = now;
    Ok(paused)
}

/// Resume a paused series
///
/// The next date is recomputed from `now`, never from the frozen value, so
/// resuming does not produce a burst of overdue documents. If the end
/// condition is already met the series completes instead.
pub fn resume(series: &RecurringSeries, now: DateTime<Utc>) -> SchedulerResult<RecurringSeries> {
    if series.status != SeriesStatus::Paused {
        return Err(SchedulerError::invalid_transition(
            &series.id,
            series.status.as_str(),
            "resume",
        ));
    }

    let params = series.schedule_params()?;
    let next = next_scheduled_date(&params, now)?;

    let mut resumed = series.clone();
    resumed.updated_at = now;

    if is_completed(&series.end_condition(), series.invoices_generated, Some(next)) {
        resumed.status = SeriesStatus::Completed;
        resumed.next_scheduled_at = None;
    } else {
        resumed.status = SeriesStatus::Active;
        resumed.next_scheduled_at = Some(next);
        resumed.consecutive_failures = 0;
    }

    Ok(resumed)
}

/// Cancel an active or paused series; terminal
pub fn cancel(series: &RecurringSeries, now: DateTime<Utc>) -> SchedulerResult<RecurringSeries> {
    if series.status.is_terminal() {
        return Err(SchedulerError::invalid_transition(
            &series.id,
            series.status.as_str(),
            "cancel",
        ));
    }

    let mut canceled = series.clone();
    canceled.status = SeriesStatus::Canceled;
    canceled.next_scheduled_at = None;
    canceled.updated_at = now;
    Ok(canceled)
}

/// Merge a configuration patch into a non-terminal series
///
/// The merged series is validated as a whole. When a schedule field changes
/// on an active series the next date is recomputed from `now`.
pub fn apply_patch(
    series: &RecurringSeries,
    patch: &SeriesPatch,
    now: DateTime<Utc>,
) -> SchedulerResult<RecurringSeries> {
    if series.status.is_terminal() {
        return Err(SchedulerError::invalid_transition(
            &series.id,
            series.status.as_str(),
            "update",
        ));
    }

    let mut merged = patch.apply_to(series);

    // Switching the end type away from a bound drops the stale value
    match merged.end_type {
        EndType::Never => {
            merged.end_date = None;
            merged.end_count = None;
        }
        EndType::OnDate => merged.end_count = None,
        EndType::AfterCount => merged.end_date = None,
    }

    parse_timezone(&merged.timezone)?;
    validate_frequency_params(
        merged.frequency,
        merged.frequency_day,
        merged.frequency_week,
        merged.frequency_interval,
    )?;
    merged.end_condition().validate()?;

    if patch.touches_schedule() && merged.status == SeriesStatus::Active {
        let params = merged.schedule_params()?;
        merged.next_scheduled_at = Some(next_scheduled_date(&params, now)?);
    }

    merged.updated_at = now;
    Ok(merged)
}

// ============================================================================
// Recurring Info
// ============================================================================

/// Where a generated document sits in its series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringInfo {
    pub series_id: String,
    pub sequence: u32,
    /// Only known for `after_count` series
    pub total_count: Option<u32>,
    pub frequency: String,
    pub status: SeriesStatus,
    pub next_scheduled_at: Option<DateTime<Utc>>,
}

impl RecurringInfo {
    /// e.g. "3 of 12" or "3"
    pub fn position(&self) -> String {
        match self.total_count {
            Some(total) => format!("{} of {}", self.sequence, total),
            None => self.sequence.to_string(),
        }
    }
}

// ============================================================================
// Lifecycle Manager
// ============================================================================

/// Store-backed lifecycle operations
pub struct LifecycleManager<R: SeriesRepository + ?Sized = dyn SeriesRepository> {
    repo: Arc<R>,
}

impl<R: SeriesRepository + ?Sized> LifecycleManager<R> {
    /// Create a manager over a repository
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Validate and store a new series
    pub fn create(&self, draft: SeriesDraft, now: DateTime<Utc>) -> Result<RecurringSeries> {
        let series = RecurringSeries::create(draft, now)?;
        self.repo.insert_series(&series)?;

        tracing::info!(
            series_id = %series.id,
            team_id = %series.team_id,
            frequency = %series.frequency,
            next_scheduled_at = ?series.next_scheduled_at,
            "Recurring series created"
        );
        Ok(series)
    }

    /// Apply a configuration patch
    pub fn update(&self, id: &str, patch: &SeriesPatch, now: DateTime<Utc>) -> Result<RecurringSeries> {
        let updated = self
            .repo
            .modify_existing(id, &|current| Ok(Some(apply_patch(current, patch, now)?)))?;

        tracing::info!(
            series_id = %id,
            schedule_changed = patch.touches_schedule(),
            next_scheduled_at = ?updated.next_scheduled_at,
            "Recurring series updated"
        );
        Ok(updated)
    }

    /// Pause an active series
    pub fn pause(&self, id: &str, now: DateTime<Utc>) -> Result<RecurringSeries> {
        let paused = self
            .repo
            .modify_existing(id, &|current| Ok(Some(pause(current, now)?)))?;

        tracing::info!(series_id = %id, "Recurring series paused");
        Ok(paused)
    }

    /// Resume a paused series
    pub fn resume(&self, id: &str, now: DateTime<Utc>) -> Result<RecurringSeries> {
        let resumed = self
            .repo
            .modify_existing(id, &|current| Ok(Some(resume(current, now)?)))?;

        if resumed.status == SeriesStatus::Completed {
            metrics::record_series_completed();
            tracing::info!(series_id = %id, "End condition reached on resume, series completed");
        } else {
            tracing::info!(
                series_id = %id,
                next_scheduled_at = ?resumed.next_scheduled_at,
                "Recurring series resumed"
            );
        }
        Ok(resumed)
    }

    /// Cancel a series
    pub fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<RecurringSeries> {
        let canceled = self
            .repo
            .modify_existing(id, &|current| Ok(Some(cancel(current, now)?)))?;

        tracing::info!(series_id = %id, "Recurring series canceled");
        Ok(canceled)
    }

    /// Get a series, failing if it does not exist
    pub fn get(&self, id: &str) -> Result<RecurringSeries> {
        self.repo
            .get_series(id)?
            .ok_or_else(|| SchedulerError::series_not_found(id).into())
    }

    /// List series
    pub fn list(&self, filter: &SeriesFilter) -> Result<Vec<RecurringSeries>> {
        self.repo.list_series(filter)
    }

    /// Preview the next occurrences of one series
    pub fn upcoming(
        &self,
        id: &str,
        limit: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<UpcomingSchedule> {
        let series = self.get(id)?;
        let params = series.schedule_params()?;
        let start = series.next_scheduled_at.unwrap_or(now);

        let schedule = upcoming_occurrences(
            &params,
            &series.end_condition(),
            start,
            series.invoices_generated,
            series.amount.unwrap_or(0.0),
            series.currency.as_deref().unwrap_or(DEFAULT_CURRENCY),
            limit.unwrap_or(DEFAULT_UPCOMING_LIMIT),
        )?;
        Ok(schedule)
    }

    /// Series position of a generated document
    pub fn document_info(&self, document_id: &str) -> Result<Option<RecurringInfo>> {
        let Some(document) = self.repo.get_document(document_id)? else {
            return Ok(None);
        };
        let Some(series_id) = document.series_id else {
            return Ok(None);
        };
        let Some(series) = self.repo.get_series(&series_id)? else {
            return Ok(None);
        };

        Ok(Some(RecurringInfo {
            series_id,
            sequence: document.sequence,
            total_count: match series.end_type {
                EndType::AfterCount => series.end_count,
                _ => None,
            },
            frequency: series.describe_schedule(),
            status: series.status,
            next_scheduled_at: series.next_scheduled_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{EndCondition, Frequency, GeneratedDocument};
    use crate::storage::{MockSeriesRepository, SqliteSeriesRepository};
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn monthly(now: DateTime<Utc>) -> RecurringSeries {
        let draft = SeriesDraft::new("team-1", "user-1", Frequency::MonthlyDate)
            .day(1)
            .priced(250.0, "EUR");
        RecurringSeries::create(draft, now).unwrap()
    }

    #[test]
    fn test_pause_keeps_next_date() {
        let now = at(2025, 1, 1);
        let series = monthly(now);
        let paused = pause(&series, at(2025, 1, 2)).unwrap();

        assert_eq!(paused.status, SeriesStatus::Paused);
        assert_eq!(paused.next_scheduled_at, series.next_scheduled_at);
        assert!(pause(&paused, now).is_err());
    }

    #[test]
    fn test_resume_recomputes_from_now() {
        let series = monthly(at(2025, 1, 1));
        let paused = pause(&series, at(2025, 1, 2)).unwrap();

        let resumed = resume(&paused, at(2025, 5, 10)).unwrap();
        assert_eq!(resumed.status, SeriesStatus::Active);
        assert_eq!(resumed.next_scheduled_at, Some(at(2025, 6, 1)));
    }

    #[test]
    fn test_resume_resets_failures() {
        let mut series = monthly(at(2025, 1, 1));
        series.consecutive_failures = 3;
        series.status = SeriesStatus::Paused;

        let resumed = resume(&series, at(2025, 1, 5)).unwrap();
        assert_eq!(resumed.consecutive_failures, 0);
    }

    #[test]
    fn test_resume_completes_when_end_reached() {
        let mut series = monthly(at(2025, 1, 1));
        series.status = SeriesStatus::Paused;
        series.end_type = EndType::OnDate;
        series.end_date = Some(at(2025, 3, 1));

        let resumed = resume(&series, at(2025, 4, 15)).unwrap();
        assert_eq!(resumed.status, SeriesStatus::Completed);
        assert!(resumed.next_scheduled_at.is_none());

        let mut counted = monthly(at(2025, 1, 1));
        counted.status = SeriesStatus::Paused;
        counted.end_type = EndType::AfterCount;
        counted.end_count = Some(4);
        counted.invoices_generated = 4;
        assert_eq!(
            resume(&counted, at(2025, 2, 1)).unwrap().status,
            SeriesStatus::Completed
        );
    }

    #[test]
    fn test_resume_requires_paused() {
        let series = monthly(at(2025, 1, 1));
        let err = resume(&series, at(2025, 1, 2)).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
    }

    #[test]
    fn test_cancel_is_terminal() {
        let series = monthly(at(2025, 1, 1));
        let canceled = cancel(&series, at(2025, 1, 2)).unwrap();
        assert_eq!(canceled.status, SeriesStatus::Canceled);
        assert!(canceled.next_scheduled_at.is_none());

        assert!(cancel(&canceled, at(2025, 1, 3)).is_err());
        assert!(resume(&canceled, at(2025, 1, 3)).is_err());
        assert!(pause(&canceled, at(2025, 1, 3)).is_err());

        let paused = pause(&series, at(2025, 1, 2)).unwrap();
        assert!(cancel(&paused, at(2025, 1, 3)).is_ok());
    }

    #[test]
    fn test_apply_patch_recomputes_schedule() {
        let series = monthly(at(2025, 1, 1));
        let patch = SeriesPatch {
            frequency_day: Some(20),
            ..Default::default()
        };

        let updated = apply_patch(&series, &patch, at(2025, 1, 10)).unwrap();
        assert_eq!(updated.frequency_day, Some(20));
        assert_eq!(updated.next_scheduled_at, Some(at(2025, 2, 20)));

        let price_only = SeriesPatch {
            amount: Some(300.0),
            ..Default::default()
        };
        let repriced = apply_patch(&series, &price_only, at(2025, 1, 10)).unwrap();
        assert_eq!(repriced.next_scheduled_at, series.next_scheduled_at);
        assert_eq!(repriced.amount, Some(300.0));
    }

    #[test]
    fn test_apply_patch_validates_merged_series() {
        let series = monthly(at(2025, 1, 1));

        let bad_end = SeriesPatch {
            end_type: Some(EndType::AfterCount),
            ..Default::default()
        };
        assert!(apply_patch(&series, &bad_end, at(2025, 1, 2)).is_err());

        let bad_day = SeriesPatch {
            frequency: Some(Frequency::Weekly),
            frequency_day: Some(9),
            ..Default::default()
        };
        assert!(apply_patch(&series, &bad_day, at(2025, 1, 2)).is_err());

        let canceled = cancel(&series, at(2025, 1, 2)).unwrap();
        let rename = SeriesPatch {
            customer_name: Some("Acme".to_string()),
            ..Default::default()
        };
        assert!(apply_patch(&canceled, &rename, at(2025, 1, 3)).is_err());
    }

    #[test]
    fn test_manager_round_trip() {
        let repos: Vec<Arc<dyn SeriesRepository>> = vec![
            Arc::new(SqliteSeriesRepository::in_memory().unwrap()),
            Arc::new(MockSeriesRepository::new()),
        ];

        for repo in repos {
            let manager = LifecycleManager::new(repo);
            let draft = SeriesDraft::new("team-1", "user-1", Frequency::Weekly)
                .day(5)
                .ending(EndCondition::after_count(3));
            let series = manager.create(draft, at(2025, 1, 1)).unwrap();

            manager.pause(&series.id, at(2025, 1, 2)).unwrap();
            let stored = manager.get(&series.id).unwrap();
            assert_eq!(stored.status, SeriesStatus::Paused);

            let err = manager.pause(&series.id, at(2025, 1, 2)).unwrap_err();
            assert!(matches!(
                err,
                Error::Scheduler(SchedulerError::InvalidTransition { .. })
            ));

            let resumed = manager.resume(&series.id, at(2025, 1, 8)).unwrap();
            assert_eq!(resumed.status, SeriesStatus::Active);
            // 2025-01-08 is a Wednesday; next Friday is the 10th
            assert_eq!(resumed.next_scheduled_at, Some(at(2025, 1, 10)));

            manager.cancel(&series.id, at(2025, 1, 9)).unwrap();
            assert!(manager.resume(&series.id, at(2025, 1, 10)).is_err());

            let missing = manager.get("nope").unwrap_err();
            assert!(matches!(
                missing,
                Error::Scheduler(SchedulerError::SeriesNotFound { .. })
            ));
        }
    }

    #[test]
    fn test_manager_upcoming_defaults() {
        let manager = LifecycleManager::new(Arc::new(MockSeriesRepository::new()));
        let draft = SeriesDraft::new("team-1", "user-1", Frequency::Custom).interval(7);
        let series = manager.create(draft, at(2025, 1, 1)).unwrap();

        let preview = manager.upcoming(&series.id, None, at(2025, 1, 1)).unwrap();
        assert_eq!(preview.occurrences.len(), DEFAULT_UPCOMING_LIMIT);
        assert_eq!(preview.occurrences[0].date, at(2025, 1, 1));
        assert_eq!(preview.occurrences[1].date, at(2025, 1, 8));
        assert_eq!(preview.occurrences[0].amount, 0.0);
        assert_eq!(preview.summary.currency, DEFAULT_CURRENCY);
    }

    #[test]
    fn test_manager_document_info() {
        let repo = Arc::new(MockSeriesRepository::new());
        let manager = LifecycleManager::new(repo.clone());
        let draft = SeriesDraft::new("team-1", "user-1", Frequency::MonthlyDate)
            .day(1)
            .ending(EndCondition::after_count(12));
        let series = manager.create(draft, at(2025, 1, 1)).unwrap();

        let doc = GeneratedDocument::for_cycle(&series, at(2025, 1, 1), at(2025, 1, 1));
        repo.claim_document(&doc, at(2024, 12, 31)).unwrap();

        let info = manager.document_info(&doc.id).unwrap().unwrap();
        assert_eq!(info.sequence, 1);
        assert_eq!(info.total_count, Some(12));
        assert_eq!(info.position(), "1 of 12");
        assert_eq!(info.frequency, "Monthly on the 1st");

        assert!(manager.document_info("missing").unwrap().is_none());
    }
}
