//! Common test utilities

use chrono::{DateTime, TimeZone, Utc};
use recur::models::{Frequency, SeriesDraft};
use recur::storage::{create_sqlite_repository, SharedSeriesRepository};
use tempfile::TempDir;

/// 09:00 UTC on the given day
pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
}

/// Monthly series on the 1st, priced in USD
#[allow(dead_code)]
pub fn monthly_draft() -> SeriesDraft {
    SeriesDraft::new("team-1", "user-1", Frequency::MonthlyDate)
        .day(1)
        .priced(250.0, "USD")
}

/// SQLite repository in a temporary directory
///
/// Keep the returned directory alive for the duration of the test.
pub fn sqlite_repo() -> (TempDir, SharedSeriesRepository) {
    let dir = TempDir::new().unwrap();
    let repo = create_sqlite_repository(dir.path().join("recur.db")).unwrap();
    (dir, repo)
}
