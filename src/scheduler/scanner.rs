//! Due-series scanner
//!
//! Picks the batch of active series whose next occurrence has arrived.
//! Oldest `next_scheduled_at` goes first so a backlog drains in order; one
//! extra row is fetched to tell the caller whether more remain.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::RecurringSeries;
use crate::storage::SeriesRepository;

/// Default number of due series per tick
pub const DEFAULT_DUE_BATCH_SIZE: usize = 50;

/// One batch of due series
#[derive(Debug, Clone, Default)]
pub struct DueBatch {
    pub series: Vec<RecurringSeries>,
    /// More due series exist beyond this batch
    pub has_more: bool,
}

impl DueBatch {
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// Select up to `limit` due series at `now`
pub fn scan_due<R: SeriesRepository + ?Sized>(
    repo: &R,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<DueBatch> {
    let limit = limit.max(1);
    let mut series = repo.due_series(now, limit + 1)?;
    let has_more = series.len() > limit;
    series.truncate(limit);

    tracing::debug!(due = series.len(), has_more, "Scanned due series");
    Ok(DueBatch { series, has_more })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Frequency, SeriesDraft, SeriesStatus};
    use crate::storage::MockSeriesRepository;
    use chrono::{Duration, TimeZone};

    fn seed(repo: &MockSeriesRepository, next: DateTime<Utc>, status: SeriesStatus) -> String {
        let draft = SeriesDraft::new("team-1", "user-1", Frequency::Custom).interval(1);
        let mut series = crate::models::RecurringSeries::create(draft, next).unwrap();
        series.next_scheduled_at = Some(next);
        series.status = status;
        repo.insert_series(&series).unwrap();
        series.id
    }

    #[test]
    fn test_scan_due_has_more() {
        let repo = MockSeriesRepository::new();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        let mut expected = Vec::new();
        for hours in [5, 4, 3] {
            expected.push(seed(&repo, now - Duration::hours(hours), SeriesStatus::Active));
        }
        seed(&repo, now + Duration::hours(1), SeriesStatus::Active);
        seed(&repo, now - Duration::hours(10), SeriesStatus::Paused);

        let batch = scan_due(&repo, now, 2).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.has_more);
        assert_eq!(batch.series[0].id, expected[0]);
        assert_eq!(batch.series[1].id, expected[1]);

        let batch = scan_due(&repo, now, 3).unwrap();
        assert_eq!(batch.len(), 3);
        assert!(!batch.has_more);
    }

    #[test]
    fn test_scan_due_includes_exact_instant() {
        let repo = MockSeriesRepository::new();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        seed(&repo, now, SeriesStatus::Active);

        assert_eq!(scan_due(&repo, now, DEFAULT_DUE_BATCH_SIZE).unwrap().len(), 1);
        assert!(scan_due(&repo, now - Duration::seconds(1), DEFAULT_DUE_BATCH_SIZE)
            .unwrap()
            .is_empty());
    }
}
