//! Upcoming-due notifications
//!
//! Selects active series that fire within the lookahead window and have not
//! been notified for their current cycle, hands them to a [`Notifier`] and
//! stamps `upcoming_notification_sent_at` once the notifier acknowledges.
//!
//! A stamp belongs to an earlier cycle when it is older than
//! `next_scheduled_at - (lookahead_hours + 1)h`; such series are notified
//! again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::SchedulerResult;
use crate::error::Result;
use crate::metrics;
use crate::models::RecurringSeries;
use crate::storage::SeriesRepository;

/// Default lookahead window
pub const DEFAULT_LOOKAHEAD_HOURS: u32 = 24;

/// Default number of notices per run
pub const DEFAULT_NOTIFICATION_BATCH_SIZE: usize = 100;

// ============================================================================
// Notifier
// ============================================================================

/// What a notifier receives for one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpcomingDue {
    pub series_id: String,
    pub team_id: String,
    pub user_id: String,
    pub customer_name: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub schedule: String,
}

impl From<&RecurringSeries> for UpcomingDue {
    fn from(series: &RecurringSeries) -> Self {
        Self {
            series_id: series.id.clone(),
            team_id: series.team_id.clone(),
            user_id: series.user_id.clone(),
            customer_name: series.customer_name.clone(),
            scheduled_at: series.next_scheduled_at.unwrap_or(series.updated_at),
            amount: series.amount,
            currency: series.currency.clone(),
            schedule: series.describe_schedule(),
        }
    }
}

/// Delivers upcoming-due notices
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one batch; `Ok` means every notice was accepted
    async fn notify(&self, batch: &[UpcomingDue]) -> SchedulerResult<()>;
}

/// Notifier that only logs
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, batch: &[UpcomingDue]) -> SchedulerResult<()> {
        for due in batch {
            tracing::info!(
                series_id = %due.series_id,
                team_id = %due.team_id,
                scheduled_at = %due.scheduled_at,
                schedule = %due.schedule,
                "Upcoming document"
            );
        }
        Ok(())
    }
}

// ============================================================================
// Selector
// ============================================================================

/// One batch of series to notify
#[derive(Debug, Clone, Default)]
pub struct UpcomingBatch {
    pub series: Vec<RecurringSeries>,
    pub has_more: bool,
}

/// Select up to `limit` series due within `lookahead_hours` of `now`
pub fn select_upcoming<R: SeriesRepository + ?Sized>(
    repo: &R,
    now: DateTime<Utc>,
    lookahead_hours: u32,
    limit: usize,
) -> Result<UpcomingBatch> {
    let limit = limit.max(1);
    let mut series = repo.upcoming_unnotified(now, lookahead_hours, limit + 1)?;
    let has_more = series.len() > limit;
    series.truncate(limit);

    Ok(UpcomingBatch { series, has_more })
}

/// Outcome of one notification run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub selected: usize,
    pub notified: usize,
    pub has_more: bool,
}

/// Select, notify and stamp one batch
///
/// Nothing is stamped when the notifier fails, so the same series are picked
/// up again on the next run.
pub async fn send_upcoming_notifications<R, N>(
    repo: &R,
    notifier: &N,
    now: DateTime<Utc>,
    lookahead_hours: u32,
    limit: usize,
) -> Result<NotifyReport>
where
    R: SeriesRepository + ?Sized,
    N: Notifier + ?Sized,
{
    let batch = select_upcoming(repo, now, lookahead_hours, limit)?;
    if batch.series.is_empty() {
        return Ok(NotifyReport::default());
    }

    let notices: Vec<UpcomingDue> = batch.series.iter().map(UpcomingDue::from).collect();
    notifier.notify(&notices).await?;

    let ids: Vec<String> = batch.series.iter().map(|s| s.id.clone()).collect();
    let notified = repo.mark_notification_sent(&ids, now)?;
    metrics::record_notifications_sent(notified);

    tracing::info!(
        selected = batch.series.len(),
        notified,
        has_more = batch.has_more,
        "Upcoming notifications sent"
    );

    Ok(NotifyReport {
        selected: batch.series.len(),
        notified,
        has_more: batch.has_more,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{Frequency, SeriesDraft};
    use crate::scheduler::error::SchedulerError;
    use crate::storage::MockSeriesRepository;
    use chrono::{Duration, TimeZone};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, batch: &[UpcomingDue]) -> SchedulerResult<()> {
            if self.fail {
                return Err(SchedulerError::notification_failed("mailer offline"));
            }
            let mut seen = self.seen.lock().unwrap();
            seen.extend(batch.iter().map(|d| d.series_id.clone()));
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    fn seed(repo: &MockSeriesRepository, next: DateTime<Utc>) -> String {
        let draft = SeriesDraft::new("team-1", "user-1", Frequency::Weekly).day(1);
        let mut series = RecurringSeries::create(draft, now()).unwrap();
        series.next_scheduled_at = Some(next);
        repo.insert_series(&series).unwrap();
        series.id
    }

    #[tokio::test]
    async fn test_notifies_once_per_cycle() {
        let repo = MockSeriesRepository::new();
        let soon = seed(&repo, now() + Duration::hours(6));
        seed(&repo, now() + Duration::hours(48));

        let notifier = RecordingNotifier::default();
        let report = send_upcoming_notifications(&repo, &notifier, now(), 24, 100)
            .await
            .unwrap();
        assert_eq!(report.notified, 1);
        assert_eq!(*notifier.seen.lock().unwrap(), vec![soon.clone()]);

        // Second run in the same cycle is a no-op
        let report = send_upcoming_notifications(&repo, &notifier, now(), 24, 100)
            .await
            .unwrap();
        assert_eq!(report, NotifyReport::default());

        // Next cycle: the stamp is older than the resend cutoff
        repo.modify_series(&soon, &|s| {
            let mut next = s.clone();
            next.next_scheduled_at = Some(now() + Duration::days(7));
            Ok(Some(next))
        })
        .unwrap();
        let later = now() + Duration::days(6) + Duration::hours(12);
        let report = send_upcoming_notifications(&repo, &notifier, later, 24, 100)
            .await
            .unwrap();
        assert_eq!(report.notified, 1);
    }

    #[tokio::test]
    async fn test_failed_notifier_does_not_stamp() {
        let repo = MockSeriesRepository::new();
        let id = seed(&repo, now() + Duration::hours(2));

        let notifier = RecordingNotifier {
            fail: true,
            ..Default::default()
        };
        let err = send_upcoming_notifications(&repo, &notifier, now(), 24, 100)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Scheduler(SchedulerError::NotificationFailed { .. })
        ));

        let series = repo.get_series(&id).unwrap().unwrap();
        assert!(series.upcoming_notification_sent_at.is_none());
    }

    #[test]
    fn test_select_upcoming_has_more() {
        let repo = MockSeriesRepository::new();
        for hours in 1..=3 {
            seed(&repo, now() + Duration::hours(hours));
        }

        let batch = select_upcoming(&repo, now(), 24, 2).unwrap();
        assert_eq!(batch.series.len(), 2);
        assert!(batch.has_more);
    }

    #[tokio::test]
    async fn test_log_notifier_acknowledges() {
        let repo = MockSeriesRepository::new();
        seed(&repo, now() + Duration::hours(1));

        let report = send_upcoming_notifications(
            &repo,
            &LogNotifier,
            now(),
            DEFAULT_LOOKAHEAD_HOURS,
            DEFAULT_NOTIFICATION_BATCH_SIZE,
        )
        .await
        .unwrap();
        assert_eq!(report.notified, 1);
        assert!(!report.has_more);
    }
}
