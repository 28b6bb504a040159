//! Repository Pattern for Series Persistence
//!
//! Business logic talks to [`SeriesRepository`]; the SQLite implementation
//! backs production and the mock implementation backs tests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Business Logic                          │
//! │        (generation engine, lifecycle, scanners)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   SeriesRepository                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                 ┌────────────┴────────────┐
//!                 ▼                         ▼
//!        ┌─────────────────┐       ┌─────────────────┐
//!        │     SQLite      │       │      Mock       │
//!        │  Implementation │       │ Implementation  │
//!        └─────────────────┘       └─────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - At most one [`GeneratedDocument`] exists per (series id, sequence).
//!   SQLite enforces this with a unique index; claims use
//!   `INSERT ... ON CONFLICT DO NOTHING`.
//! - [`SeriesRepository::modify_series`] runs read, compute and write as one
//!   unit (an immediate transaction in SQLite, a write lock in the mock), so
//!   two workers can never both advance the same series from the same state.
//!
//! # Usage
//!
//! ```rust,ignore
//! use recur::storage::repository::{SeriesRepository, SqliteSeriesRepository};
//!
//! // Production: use SQLite
//! let repo = SqliteSeriesRepository::new("data/recur.db")?;
//!
//! // Testing: use Mock
//! let mock_repo = MockSeriesRepository::new();
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::error::{Error, Result};
use crate::models::{DocumentStatus, GeneratedDocument, RecurringSeries, SeriesStatus};
use crate::scheduler::error::SchedulerError;

// ============================================================================
// Core Types
// ============================================================================

/// Filter for listing series
#[derive(Debug, Clone, Default)]
pub struct SeriesFilter {
    pub status: Option<SeriesStatus>,
    pub team_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl SeriesFilter {
    /// Only series with the given status
    pub fn with_status(status: SeriesStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Whether a series passes the status and team filters
    pub fn matches(&self, series: &RecurringSeries) -> bool {
        self.status.is_none_or(|s| s == series.status)
            && self.team_id.as_ref().is_none_or(|t| *t == series.team_id)
    }
}

/// Result of claiming the document slot for (series, sequence)
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// New pending document inserted; caller owns the dispatch
    Claimed(GeneratedDocument),
    /// Failed or stale attempt flipped back to pending; caller owns the dispatch
    Reclaimed(GeneratedDocument),
    /// Document already generated; nothing to dispatch
    AlreadyGenerated(GeneratedDocument),
    /// Another worker holds the slot
    InFlight(GeneratedDocument),
    /// The stored series no longer expects this document (paused, canceled,
    /// rescheduled or already advanced); holds the current row
    SeriesChanged(RecurringSeries),
}

impl ClaimOutcome {
    /// The document behind the outcome, if the slot exists
    pub fn document(&self) -> Option<&GeneratedDocument> {
        match self {
            Self::Claimed(d) | Self::Reclaimed(d) | Self::AlreadyGenerated(d) | Self::InFlight(d) => Some(d),
            Self::SeriesChanged(_) => None,
        }
    }

    /// Whether the caller must dispatch the document
    pub fn should_dispatch(&self) -> bool {
        matches!(self, Self::Claimed(_) | Self::Reclaimed(_))
    }
}

/// Read-compute-write callback for [`SeriesRepository::modify_series`]
///
/// Returns `Ok(None)` to leave the row untouched. Runs while the repository
/// holds its lock, so it must not call back into the repository.
pub type SeriesMutation<'a> = &'a dyn Fn(&RecurringSeries) -> Result<Option<RecurringSeries>>;

// ============================================================================
// Repository Trait
// ============================================================================

/// Persistence for recurring series and their generated documents
pub trait SeriesRepository: Send + Sync {
    /// Store a new series
    fn insert_series(&self, series: &RecurringSeries) -> Result<()>;

    /// Get series by ID
    fn get_series(&self, id: &str) -> Result<Option<RecurringSeries>>;

    /// List series ordered by creation time
    fn list_series(&self, filter: &SeriesFilter) -> Result<Vec<RecurringSeries>>;

    /// Atomically read, transform and write one series
    ///
    /// Fails with [`SchedulerError::SeriesNotFound`] if the id is unknown.
    fn modify_series(&self, id: &str, mutation: SeriesMutation<'_>) -> Result<Option<RecurringSeries>>;

    /// Active series with `next_scheduled_at <= now`, oldest first
    fn due_series(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RecurringSeries>>;

    /// Active series due within the lookahead window that have not been
    /// notified for their current cycle, soonest first
    fn upcoming_unnotified(
        &self,
        now: DateTime<Utc>,
        lookahead_hours: u32,
        limit: usize,
    ) -> Result<Vec<RecurringSeries>>;

    /// Stamp `upcoming_notification_sent_at` on the given series
    fn mark_notification_sent(&self, ids: &[String], sent_at: DateTime<Utc>) -> Result<usize>;

    /// Claim the document slot for `document.series_id` / `document.sequence`
    ///
    /// Pending documents last touched at or before `stale_before` are
    /// treated like failed ones and reclaimed.
    ///
    /// The series row is re-read under the same lock: unless it is still
    /// active, due at `document.updated_at` and expecting `document.sequence`,
    /// nothing is written and [`ClaimOutcome::SeriesChanged`] is returned.
    /// An already generated slot is reported before that check so a lost
    /// success transition can still be reconciled.
    fn claim_document(
        &self,
        document: &GeneratedDocument,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome>;

    /// Mark a document generated
    fn complete_document(&self, document_id: &str, now: DateTime<Utc>) -> Result<()>;

    /// Mark a document failed
    fn fail_document(&self, document_id: &str, error: &str, now: DateTime<Utc>) -> Result<()>;

    /// Get document by ID
    fn get_document(&self, id: &str) -> Result<Option<GeneratedDocument>>;

    /// All documents of a series ordered by sequence
    fn documents_for_series(&self, series_id: &str) -> Result<Vec<GeneratedDocument>>;

    /// Apply the same mutation to a series, converting a missing row into
    /// a `SeriesNotFound` error with the id filled in
    fn modify_existing(&self, id: &str, mutation: SeriesMutation<'_>) -> Result<RecurringSeries> {
        match self.modify_series(id, mutation)? {
            Some(series) => Ok(series),
            None => self
                .get_series(id)?
                .ok_or_else(|| SchedulerError::series_not_found(id).into()),
        }
    }
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::other("Repository lock poisoned")
}

fn to_millis(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

/// Whether `series` still expects `document` to be generated now
fn accepts_claim(series: &RecurringSeries, document: &GeneratedDocument) -> bool {
    series.is_due(document.updated_at) && series.next_sequence() == document.sequence
}

fn upcoming_cutoff(next: DateTime<Utc>, lookahead_hours: u32) -> DateTime<Utc> {
    next - Duration::hours(i64::from(lookahead_hours) + 1)
}

// ============================================================================
// SQLite Implementation
// ============================================================================

const SERIES_COLUMNS: &str = "id, team_id, user_id, customer_id, customer_name, \
     frequency, frequency_day, frequency_week, frequency_interval, timezone, due_date_offset, \
     end_type, end_date, end_count, amount, currency, payload, \
     status, invoices_generated, consecutive_failures, next_scheduled_at, last_generated_at, \
     upcoming_notification_sent_at, created_at, updated_at";

const DOCUMENT_COLUMNS: &str = "id, series_id, sequence, status, attempts, amount, currency, \
     payload, scheduled_at, issue_date, due_date, last_error, created_at, updated_at";

/// SQLite implementation of SeriesRepository
///
/// Uses `Mutex` to ensure thread-safety for the SQLite connection.
pub struct SqliteSeriesRepository {
    conn: Mutex<Connection>,
}

impl SqliteSeriesRepository {
    /// Create a new SQLite repository
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;

        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite repository initialized");
        Ok(repo)
    }

    /// Create in-memory repository (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.create_schema()?;
        Ok(repo)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(poisoned)
    }

    /// Create database schema
    fn create_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS recurring_series (
                    id TEXT PRIMARY KEY,
                    team_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    customer_id TEXT,
                    customer_name TEXT,
                    frequency TEXT NOT NULL,
                    frequency_day INTEGER,
                    frequency_week INTEGER,
                    frequency_interval INTEGER,
                    timezone TEXT NOT NULL,
                    due_date_offset INTEGER NOT NULL DEFAULT 30,
                    end_type TEXT NOT NULL DEFAULT 'never',
                    end_date INTEGER,
                    end_count INTEGER,
                    amount REAL,
                    currency TEXT,
                    payload TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'active',
                    invoices_generated INTEGER NOT NULL DEFAULT 0,
                    consecutive_failures INTEGER NOT NULL DEFAULT 0,
                    next_scheduled_at INTEGER,
                    last_generated_at INTEGER,
                    upcoming_notification_sent_at INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_recurring_series_due
                    ON recurring_series(status, next_scheduled_at);

                CREATE INDEX IF NOT EXISTS idx_recurring_series_team
                    ON recurring_series(team_id);

                CREATE TABLE IF NOT EXISTS generated_documents (
                    id TEXT PRIMARY KEY,
                    series_id TEXT REFERENCES recurring_series(id),
                    sequence INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    attempts INTEGER NOT NULL DEFAULT 1,
                    amount REAL,
                    currency TEXT,
                    payload TEXT NOT NULL DEFAULT '{}',
                    scheduled_at INTEGER NOT NULL,
                    issue_date INTEGER NOT NULL,
                    due_date INTEGER NOT NULL,
                    last_error TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_generated_documents_series_sequence
                    ON generated_documents(series_id, sequence);
                "#,
        )?;

        Ok(())
    }

    fn read_series(conn: &Connection, id: &str) -> Result<Option<RecurringSeries>> {
        let sql = format!("SELECT {SERIES_COLUMNS} FROM recurring_series WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![id], series_from_row)
            .optional()?)
    }

    fn read_document_by_key(
        conn: &Connection,
        series_id: &str,
        sequence: u32,
    ) -> Result<Option<GeneratedDocument>> {
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM generated_documents WHERE series_id = ?1 AND sequence = ?2"
        );
        Ok(conn
            .query_row(&sql, params![series_id, sequence], document_from_row)
            .optional()?)
    }

    fn write_series(conn: &Connection, series: &RecurringSeries) -> Result<usize> {
        let payload = serde_json::to_string(&series.payload)?;
        let changed = conn.execute(
            r#"
                UPDATE recurring_series SET
                    customer_id = ?2, customer_name = ?3,
                    frequency = ?4, frequency_day = ?5, frequency_week = ?6, frequency_interval = ?7,
                    timezone = ?8, due_date_offset = ?9,
                    end_type = ?10, end_date = ?11, end_count = ?12,
                    amount = ?13, currency = ?14, payload = ?15,
                    status = ?16, invoices_generated = ?17, consecutive_failures = ?18,
                    next_scheduled_at = ?19, last_generated_at = ?20,
                    upcoming_notification_sent_at = ?21, updated_at = ?22
                WHERE id = ?1
                "#,
            params![
                series.id,
                series.customer_id,
                series.customer_name,
                series.frequency.as_str(),
                series.frequency_day,
                series.frequency_week,
                series.frequency_interval,
                series.timezone,
                series.due_date_offset,
                series.end_type.as_str(),
                series.end_date.map(to_millis),
                series.end_count,
                series.amount,
                series.currency,
                payload,
                series.status.as_str(),
                series.invoices_generated,
                series.consecutive_failures,
                series.next_scheduled_at.map(to_millis),
                series.last_generated_at.map(to_millis),
                series.upcoming_notification_sent_at.map(to_millis),
                to_millis(series.updated_at),
            ],
        )?;
        Ok(changed)
    }

    fn query_series<P: rusqlite::Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<RecurringSeries>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, series_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn instant_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn optional_instant_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(millis) => DateTime::from_timestamp_millis(millis)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis)),
        None => Ok(None),
    }
}

fn series_from_row(row: &Row<'_>) -> rusqlite::Result<RecurringSeries> {
    Ok(RecurringSeries {
        id: row.get(0)?,
        team_id: row.get(1)?,
        user_id: row.get(2)?,
        customer_id: row.get(3)?,
        customer_name: row.get(4)?,
        frequency: parse_column(row, 5)?,
        frequency_day: row.get(6)?,
        frequency_week: row.get(7)?,
        frequency_interval: row.get(8)?,
        timezone: row.get(9)?,
        due_date_offset: row.get(10)?,
        end_type: parse_column(row, 11)?,
        end_date: optional_instant_column(row, 12)?,
        end_count: row.get(13)?,
        amount: row.get(14)?,
        currency: row.get(15)?,
        payload: json_column(row, 16)?,
        status: parse_column(row, 17)?,
        invoices_generated: row.get(18)?,
        consecutive_failures: row.get(19)?,
        next_scheduled_at: optional_instant_column(row, 20)?,
        last_generated_at: optional_instant_column(row, 21)?,
        upcoming_notification_sent_at: optional_instant_column(row, 22)?,
        created_at: instant_column(row, 23)?,
        updated_at: instant_column(row, 24)?,
    })
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<GeneratedDocument> {
    Ok(GeneratedDocument {
        id: row.get(0)?,
        series_id: row.get(1)?,
        sequence: row.get(2)?,
        status: parse_column(row, 3)?,
        attempts: row.get(4)?,
        amount: row.get(5)?,
        currency: row.get(6)?,
        payload: json_column(row, 7)?,
        scheduled_at: instant_column(row, 8)?,
        issue_date: instant_column(row, 9)?,
        due_date: instant_column(row, 10)?,
        last_error: row.get(11)?,
        created_at: instant_column(row, 12)?,
        updated_at: instant_column(row, 13)?,
    })
}

impl SeriesRepository for SqliteSeriesRepository {
    fn insert_series(&self, series: &RecurringSeries) -> Result<()> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(&series.payload)?;

        conn.execute(
            &format!(
                "INSERT INTO recurring_series ({SERIES_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, \
                  ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)"
            ),
            params![
                series.id,
                series.team_id,
                series.user_id,
                series.customer_id,
                series.customer_name,
                series.frequency.as_str(),
                series.frequency_day,
                series.frequency_week,
                series.frequency_interval,
                series.timezone,
                series.due_date_offset,
                series.end_type.as_str(),
                series.end_date.map(to_millis),
                series.end_count,
                series.amount,
                series.currency,
                payload,
                series.status.as_str(),
                series.invoices_generated,
                series.consecutive_failures,
                series.next_scheduled_at.map(to_millis),
                series.last_generated_at.map(to_millis),
                series.upcoming_notification_sent_at.map(to_millis),
                to_millis(series.created_at),
                to_millis(series.updated_at),
            ],
        )?;

        Ok(())
    }

    fn get_series(&self, id: &str) -> Result<Option<RecurringSeries>> {
        let conn = self.conn()?;
        Self::read_series(&conn, id)
    }

    fn list_series(&self, filter: &SeriesFilter) -> Result<Vec<RecurringSeries>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SERIES_COLUMNS} FROM recurring_series
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR team_id = ?2)
             ORDER BY created_at ASC, id ASC
             LIMIT ?3 OFFSET ?4"
        );
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);

        Self::query_series(
            &conn,
            &sql,
            params![
                filter.status.map(|s| s.as_str()),
                filter.team_id,
                limit,
                filter.offset as i64
            ],
        )
    }

    fn modify_series(&self, id: &str, mutation: SeriesMutation<'_>) -> Result<Option<RecurringSeries>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current =
            Self::read_series(&tx, id)?.ok_or_else(|| Error::from(SchedulerError::series_not_found(id)))?;

        let Some(updated) = mutation(&current)? else {
            return Ok(None);
        };

        Self::write_series(&tx, &updated)?;
        tx.commit()?;

        Ok(Some(updated))
    }

    fn due_series(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RecurringSeries>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SERIES_COLUMNS} FROM recurring_series
             WHERE status = 'active' AND next_scheduled_at IS NOT NULL AND next_scheduled_at <= ?1
             ORDER BY next_scheduled_at ASC, id ASC
             LIMIT ?2"
        );
        Self::query_series(&conn, &sql, params![to_millis(now), limit as i64])
    }

    fn upcoming_unnotified(
        &self,
        now: DateTime<Utc>,
        lookahead_hours: u32,
        limit: usize,
    ) -> Result<Vec<RecurringSeries>> {
        let conn = self.conn()?;
        let window_end = now + Duration::hours(i64::from(lookahead_hours));
        let resend_gap_ms = (i64::from(lookahead_hours) + 1) * 3_600_000;
        let sql = format!(
            "SELECT {SERIES_COLUMNS} FROM recurring_series
             WHERE status = 'active'
               AND next_scheduled_at > ?1 AND next_scheduled_at <= ?2
               AND (upcoming_notification_sent_at IS NULL
                    OR upcoming_notification_sent_at < next_scheduled_at - ?3)
             ORDER BY next_scheduled_at ASC, id ASC
             LIMIT ?4"
        );
        Self::query_series(
            &conn,
            &sql,
            params![to_millis(now), to_millis(window_end), resend_gap_ms, limit as i64],
        )
    }

    fn mark_notification_sent(&self, ids: &[String], sent_at: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut stamped = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE recurring_series SET upcoming_notification_sent_at = ?1, updated_at = ?1 WHERE id = ?2",
            )?;
            for id in ids {
                stamped += stmt.execute(params![to_millis(sent_at), id])?;
            }
        }
        tx.commit()?;
        Ok(stamped)
    }

    fn claim_document(
        &self,
        document: &GeneratedDocument,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let series_id = document
            .series_id
            .as_deref()
            .ok_or_else(|| SchedulerError::validation("series_id", "required to claim a document"))?;
        let payload = serde_json::to_string(&document.payload)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = Self::read_document_by_key(&tx, series_id, document.sequence)? {
            if existing.status == DocumentStatus::Generated {
                return Ok(ClaimOutcome::AlreadyGenerated(existing));
            }
        }

        let current = Self::read_series(&tx, series_id)?
            .ok_or_else(|| Error::from(SchedulerError::series_not_found(series_id)))?;
        if !accepts_claim(&current, document) {
            return Ok(ClaimOutcome::SeriesChanged(current));
        }

        let inserted = tx.execute(
            &format!(
                "INSERT INTO generated_documents ({DOCUMENT_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
                 ON CONFLICT(series_id, sequence) DO NOTHING"
            ),
            params![
                document.id,
                series_id,
                document.sequence,
                DocumentStatus::Pending.as_str(),
                document.attempts,
                document.amount,
                document.currency,
                payload,
                to_millis(document.scheduled_at),
                to_millis(document.issue_date),
                to_millis(document.due_date),
                document.last_error,
                to_millis(document.created_at),
                to_millis(document.updated_at),
            ],
        )?;

        let outcome = if inserted == 1 {
            ClaimOutcome::Claimed(document.clone())
        } else {
            let reclaimed = tx.execute(
                r#"
                    UPDATE generated_documents SET
                        status = 'pending', attempts = attempts + 1,
                        amount = ?3, currency = ?4, payload = ?5,
                        last_error = NULL, updated_at = ?6
                    WHERE series_id = ?1 AND sequence = ?2
                      AND (status = 'failed' OR (status = 'pending' AND updated_at <= ?7))
                    "#,
                params![
                    series_id,
                    document.sequence,
                    document.amount,
                    document.currency,
                    payload,
                    to_millis(document.updated_at),
                    to_millis(stale_before),
                ],
            )?;

            let existing = Self::read_document_by_key(&tx, series_id, document.sequence)?
                .ok_or_else(|| Error::corrupt("generated_documents", "claimed slot vanished"))?;

            if reclaimed == 1 {
                ClaimOutcome::Reclaimed(existing)
            } else if existing.status == DocumentStatus::Generated {
                ClaimOutcome::AlreadyGenerated(existing)
            } else {
                ClaimOutcome::InFlight(existing)
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn complete_document(&self, document_id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE generated_documents SET status = 'generated', last_error = NULL, updated_at = ?2 WHERE id = ?1",
            params![document_id, to_millis(now)],
        )?;
        Ok(())
    }

    fn fail_document(&self, document_id: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE generated_documents SET status = 'failed', last_error = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![document_id, error, to_millis(now)],
        )?;
        Ok(())
    }

    fn get_document(&self, id: &str) -> Result<Option<GeneratedDocument>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM generated_documents WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![id], document_from_row)
            .optional()?)
    }

    fn documents_for_series(&self, series_id: &str) -> Result<Vec<GeneratedDocument>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM generated_documents WHERE series_id = ?1 ORDER BY sequence ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![series_id], document_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

// ============================================================================
// Mock Implementation (for testing)
// ============================================================================

/// In-memory mock implementation of SeriesRepository
///
/// Useful for testing without database dependencies.
pub struct MockSeriesRepository {
    series: RwLock<HashMap<String, RecurringSeries>>,
    documents: RwLock<HashMap<String, GeneratedDocument>>,
}

impl MockSeriesRepository {
    /// Create a new mock repository
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of series
    pub fn len(&self) -> usize {
        self.series.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored documents
    pub fn document_count(&self) -> usize {
        self.documents.read().map(|d| d.len()).unwrap_or(0)
    }

    fn sorted_by_schedule(mut series: Vec<RecurringSeries>, limit: usize) -> Vec<RecurringSeries> {
        series.sort_by(|a, b| {
            a.next_scheduled_at
                .cmp(&b.next_scheduled_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        series.truncate(limit);
        series
    }
}

impl Default for MockSeriesRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl SeriesRepository for MockSeriesRepository {
    fn insert_series(&self, series: &RecurringSeries) -> Result<()> {
        let mut all = self.series.write().map_err(poisoned)?;
        if all.contains_key(&series.id) {
            return Err(Error::other(format!("Series {} already exists", series.id)));
        }
        all.insert(series.id.clone(), series.clone());
        Ok(())
    }

    fn get_series(&self, id: &str) -> Result<Option<RecurringSeries>> {
        let all = self.series.read().map_err(poisoned)?;
        Ok(all.get(id).cloned())
    }

    fn list_series(&self, filter: &SeriesFilter) -> Result<Vec<RecurringSeries>> {
        let all = self.series.read().map_err(poisoned)?;
        let mut matching: Vec<_> = all.values().filter(|s| filter.matches(s)).cloned().collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    fn modify_series(&self, id: &str, mutation: SeriesMutation<'_>) -> Result<Option<RecurringSeries>> {
        let mut all = self.series.write().map_err(poisoned)?;
        let current = all
            .get(id)
            .ok_or_else(|| Error::from(SchedulerError::series_not_found(id)))?;

        let Some(updated) = mutation(current)? else {
            return Ok(None);
        };

        all.insert(id.to_string(), updated.clone());
        Ok(Some(updated))
    }

    fn due_series(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RecurringSeries>> {
        let all = self.series.read().map_err(poisoned)?;
        let due: Vec<_> = all.values().filter(|s| s.is_due(now)).cloned().collect();
        Ok(Self::sorted_by_schedule(due, limit))
    }

    fn upcoming_unnotified(
        &self,
        now: DateTime<Utc>,
        lookahead_hours: u32,
        limit: usize,
    ) -> Result<Vec<RecurringSeries>> {
        let all = self.series.read().map_err(poisoned)?;
        let window_end = now + Duration::hours(i64::from(lookahead_hours));

        let upcoming: Vec<_> = all
            .values()
            .filter(|s| s.status == SeriesStatus::Active)
            .filter(|s| {
                let Some(next) = s.next_scheduled_at else {
                    return false;
                };
                let in_window = next > now && next <= window_end;
                let not_notified = s
                    .upcoming_notification_sent_at
                    .is_none_or(|sent| sent < upcoming_cutoff(next, lookahead_hours));
                in_window && not_notified
            })
            .cloned()
            .collect();

        Ok(Self::sorted_by_schedule(upcoming, limit))
    }

    fn mark_notification_sent(&self, ids: &[String], sent_at: DateTime<Utc>) -> Result<usize> {
        let mut all = self.series.write().map_err(poisoned)?;
        let mut stamped = 0;
        for id in ids {
            if let Some(series) = all.get_mut(id) {
                series.upcoming_notification_sent_at = Some(sent_at);
                series.updated_at = sent_at;
                stamped += 1;
            }
        }
        Ok(stamped)
    }

    fn claim_document(
        &self,
        document: &GeneratedDocument,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let series_id = document
            .series_id
            .as_deref()
            .ok_or_else(|| SchedulerError::validation("series_id", "required to claim a document"))?;

        let all = self.series.read().map_err(poisoned)?;
        let mut docs = self.documents.write().map_err(poisoned)?;
        let existing = docs
            .values_mut()
            .find(|d| d.series_id.as_deref() == Some(series_id) && d.sequence == document.sequence);

        if let Some(existing) = existing.as_deref() {
            if existing.status == DocumentStatus::Generated {
                return Ok(ClaimOutcome::AlreadyGenerated(existing.clone()));
            }
        }

        let current = all
            .get(series_id)
            .ok_or_else(|| Error::from(SchedulerError::series_not_found(series_id)))?;
        if !accepts_claim(current, document) {
            return Ok(ClaimOutcome::SeriesChanged(current.clone()));
        }

        let outcome = match existing {
            None => {
                docs.insert(document.id.clone(), document.clone());
                ClaimOutcome::Claimed(document.clone())
            }
            Some(existing) => {
                let reclaimable = existing.status == DocumentStatus::Failed
                    || (existing.status == DocumentStatus::Pending && existing.updated_at <= stale_before);

                if reclaimable {
                    existing.status = DocumentStatus::Pending;
                    existing.attempts += 1;
                    existing.amount = document.amount;
                    existing.currency = document.currency.clone();
                    existing.payload = document.payload.clone();
                    existing.last_error = None;
                    existing.updated_at = document.updated_at;
                    ClaimOutcome::Reclaimed(existing.clone())
                } else if existing.status == DocumentStatus::Generated {
                    ClaimOutcome::AlreadyGenerated(existing.clone())
                } else {
                    ClaimOutcome::InFlight(existing.clone())
                }
            }
        };

        Ok(outcome)
    }

    fn complete_document(&self, document_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut docs = self.documents.write().map_err(poisoned)?;
        if let Some(doc) = docs.get_mut(document_id) {
            doc.status = DocumentStatus::Generated;
            doc.last_error = None;
            doc.updated_at = now;
        }
        Ok(())
    }

    fn fail_document(&self, document_id: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        let mut docs = self.documents.write().map_err(poisoned)?;
        if let Some(doc) = docs.get_mut(document_id) {
            if doc.status == DocumentStatus::Pending {
                doc.status = DocumentStatus::Failed;
                doc.last_error = Some(error.to_string());
                doc.updated_at = now;
            }
        }
        Ok(())
    }

    fn get_document(&self, id: &str) -> Result<Option<GeneratedDocument>> {
        let docs = self.documents.read().map_err(poisoned)?;
        Ok(docs.get(id).cloned())
    }

    fn documents_for_series(&self, series_id: &str) -> Result<Vec<GeneratedDocument>> {
        let docs = self.documents.read().map_err(poisoned)?;
        let mut found: Vec<_> = docs
            .values()
            .filter(|d| d.series_id.as_deref() == Some(series_id))
            .cloned()
            .collect();
        found.sort_by_key(|d| d.sequence);
        Ok(found)
    }
}

// ============================================================================
// Shared Repository Types
// ============================================================================

/// Thread-safe shared repository wrapper
pub type SharedSeriesRepository = Arc<dyn SeriesRepository>;

/// Create a shared SQLite repository
pub fn create_sqlite_repository(path: impl AsRef<Path>) -> Result<SharedSeriesRepository> {
    let repo = SqliteSeriesRepository::new(path)?;
    Ok(Arc::new(repo))
}

/// Create a shared mock repository
pub fn create_mock_repository() -> SharedSeriesRepository {
    Arc::new(MockSeriesRepository::new())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EndCondition, Frequency, SeriesDraft};
    use chrono::TimeZone;

    // Helper to create test repositories
    fn create_test_repos() -> Vec<Box<dyn SeriesRepository>> {
        vec![
            Box::new(SqliteSeriesRepository::in_memory().unwrap()),
            Box::new(MockSeriesRepository::new()),
        ]
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn series_due_at(next: DateTime<Utc>) -> RecurringSeries {
        let draft = SeriesDraft::new("team-1", "user-1", Frequency::MonthlyDate)
            .day(1)
            .priced(120.0, "USD");
        let mut series = RecurringSeries::create(draft, at(2025, 1, 1, 0)).unwrap();
        series.next_scheduled_at = Some(next);
        series
    }

    #[test]
    fn test_insert_and_get_series() {
        for repo in create_test_repos() {
            let mut series = series_due_at(at(2025, 2, 1, 9));
            series.payload.line_items = serde_json::json!([{"name": "Support", "price": 120}]);
            series.end_type = crate::models::EndType::OnDate;
            series.end_date = Some(at(2025, 12, 31, 0));
            repo.insert_series(&series).unwrap();

            let loaded = repo.get_series(&series.id).unwrap().unwrap();
            assert_eq!(loaded, series);
            assert!(repo.get_series("missing").unwrap().is_none());
        }
    }

    #[test]
    fn test_list_series_filters() {
        for repo in create_test_repos() {
            let active = series_due_at(at(2025, 2, 1, 9));
            let mut paused = series_due_at(at(2025, 2, 2, 9));
            paused.status = SeriesStatus::Paused;
            paused.created_at = at(2025, 1, 2, 0);
            let mut other_team = series_due_at(at(2025, 2, 3, 9));
            other_team.team_id = "team-2".to_string();
            other_team.created_at = at(2025, 1, 3, 0);

            for s in [&active, &paused, &other_team] {
                repo.insert_series(s).unwrap();
            }

            let all = repo.list_series(&SeriesFilter::default()).unwrap();
            assert_eq!(all.len(), 3);
            assert_eq!(all[0].id, active.id);

            let only_paused = repo.list_series(&SeriesFilter::with_status(SeriesStatus::Paused)).unwrap();
            assert_eq!(only_paused.len(), 1);
            assert_eq!(only_paused[0].id, paused.id);

            let team_two = repo
                .list_series(&SeriesFilter {
                    team_id: Some("team-2".to_string()),
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(team_two.len(), 1);

            let page = repo
                .list_series(&SeriesFilter {
                    limit: Some(1),
                    offset: 1,
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(page.len(), 1);
            assert_eq!(page[0].id, paused.id);
        }
    }

    #[test]
    fn test_due_series_order_and_status() {
        for repo in create_test_repos() {
            let now = at(2025, 3, 1, 12);
            let late = series_due_at(at(2025, 2, 1, 0));
            let early = series_due_at(at(2025, 1, 1, 0));
            let future = series_due_at(at(2025, 3, 2, 0));
            let mut paused = series_due_at(at(2024, 12, 1, 0));
            paused.status = SeriesStatus::Paused;

            for s in [&late, &early, &future, &paused] {
                repo.insert_series(s).unwrap();
            }

            let due = repo.due_series(now, 10).unwrap();
            let ids: Vec<_> = due.iter().map(|s| s.id.clone()).collect();
            assert_eq!(ids, vec![early.id.clone(), late.id.clone()]);

            let limited = repo.due_series(now, 1).unwrap();
            assert_eq!(limited.len(), 1);
            assert_eq!(limited[0].id, early.id);
        }
    }

    #[test]
    fn test_modify_series() {
        for repo in create_test_repos() {
            let series = series_due_at(at(2025, 2, 1, 0));
            repo.insert_series(&series).unwrap();

            let updated = repo
                .modify_series(&series.id, &|current| {
                    let mut next = current.clone();
                    next.invoices_generated += 1;
                    Ok(Some(next))
                })
                .unwrap()
                .unwrap();
            assert_eq!(updated.invoices_generated, 1);

            let untouched = repo.modify_series(&series.id, &|_| Ok(None)).unwrap();
            assert!(untouched.is_none());

            let stored = repo.get_series(&series.id).unwrap().unwrap();
            assert_eq!(stored.invoices_generated, 1);

            let missing = repo.modify_series("missing", &|_| Ok(None));
            assert!(matches!(
                missing,
                Err(Error::Scheduler(SchedulerError::SeriesNotFound { .. }))
            ));
        }
    }

    #[test]
    fn test_modify_series_error_leaves_row() {
        for repo in create_test_repos() {
            let series = series_due_at(at(2025, 2, 1, 0));
            repo.insert_series(&series).unwrap();

            let result = repo.modify_series(&series.id, &|_| {
                Err(SchedulerError::invalid_transition("x", "canceled", "pause").into())
            });
            assert!(result.is_err());
            assert_eq!(repo.get_series(&series.id).unwrap().unwrap(), series);
        }
    }

    #[test]
    fn test_upcoming_unnotified_window() {
        for repo in create_test_repos() {
            let now = at(2025, 3, 1, 0);
            let soon = series_due_at(at(2025, 3, 1, 10));
            let later = series_due_at(at(2025, 3, 3, 0));
            let past = series_due_at(at(2025, 2, 28, 0));
            let mut notified = series_due_at(at(2025, 3, 1, 20));
            notified.upcoming_notification_sent_at = Some(at(2025, 2, 28, 22));
            let mut notified_last_cycle = series_due_at(at(2025, 3, 1, 5));
            notified_last_cycle.upcoming_notification_sent_at = Some(at(2025, 2, 1, 5));

            for s in [&soon, &later, &past, &notified, &notified_last_cycle] {
                repo.insert_series(s).unwrap();
            }

            let upcoming = repo.upcoming_unnotified(now, 24, 10).unwrap();
            let ids: Vec<_> = upcoming.iter().map(|s| s.id.clone()).collect();
            assert_eq!(ids, vec![notified_last_cycle.id.clone(), soon.id.clone()]);

            let stamped = repo.mark_notification_sent(&ids, now).unwrap();
            assert_eq!(stamped, 2);
            assert!(repo.upcoming_unnotified(now, 24, 10).unwrap().is_empty());
        }
    }

    #[test]
    fn test_upcoming_stamp_at_cutoff_counts_as_sent() {
        for repo in create_test_repos() {
            let now = at(2025, 3, 1, 0);
            let next = at(2025, 3, 1, 10);
            let mut at_cutoff = series_due_at(next);
            at_cutoff.upcoming_notification_sent_at = Some(upcoming_cutoff(next, 24));
            let mut before_cutoff = series_due_at(next);
            before_cutoff.upcoming_notification_sent_at =
                Some(upcoming_cutoff(next, 24) - Duration::milliseconds(1));
            repo.insert_series(&at_cutoff).unwrap();
            repo.insert_series(&before_cutoff).unwrap();

            let ids: Vec<_> = repo
                .upcoming_unnotified(now, 24, 10)
                .unwrap()
                .into_iter()
                .map(|s| s.id)
                .collect();
            assert_eq!(ids, vec![before_cutoff.id.clone()]);
        }
    }

    #[test]
    fn test_claim_document_refused_when_series_changed() {
        for repo in create_test_repos() {
            let now = at(2025, 2, 1, 0);
            let series = series_due_at(now);
            repo.insert_series(&series).unwrap();
            let doc = GeneratedDocument::for_cycle(&series, now, now);

            repo.modify_series(&series.id, &|s| {
                let mut canceled = s.clone();
                canceled.status = SeriesStatus::Canceled;
                canceled.next_scheduled_at = None;
                Ok(Some(canceled))
            })
            .unwrap();

            let outcome = repo.claim_document(&doc, now - Duration::hours(1)).unwrap();
            match &outcome {
                ClaimOutcome::SeriesChanged(current) => {
                    assert_eq!(current.status, SeriesStatus::Canceled)
                }
                other => panic!("Unexpected outcome: {other:?}"),
            }
            assert!(outcome.document().is_none());
            assert!(!outcome.should_dispatch());
            assert!(repo.documents_for_series(&series.id).unwrap().is_empty());

            // Not yet due at the claim instant
            let early = series_due_at(now + Duration::hours(1));
            repo.insert_series(&early).unwrap();
            let doc = GeneratedDocument::for_cycle(&early, now, now);
            let outcome = repo.claim_document(&doc, now - Duration::hours(1)).unwrap();
            assert!(matches!(outcome, ClaimOutcome::SeriesChanged(_)));
        }
    }

    #[test]
    fn test_claim_document_is_idempotent() {
        for repo in create_test_repos() {
            let now = at(2025, 2, 1, 0);
            let series = series_due_at(now);
            repo.insert_series(&series).unwrap();

            let first = GeneratedDocument::for_cycle(&series, now, now);
            let second = GeneratedDocument::for_cycle(&series, now, now);

            let outcome = repo.claim_document(&first, now - Duration::hours(1)).unwrap();
            assert!(matches!(outcome, ClaimOutcome::Claimed(_)));

            let outcome = repo.claim_document(&second, now - Duration::hours(1)).unwrap();
            assert!(matches!(outcome, ClaimOutcome::InFlight(_)));
            assert_eq!(outcome.document().map(|d| d.id.as_str()), Some(first.id.as_str()));

            repo.complete_document(&first.id, now).unwrap();
            let outcome = repo.claim_document(&second, now - Duration::hours(1)).unwrap();
            assert!(matches!(outcome, ClaimOutcome::AlreadyGenerated(_)));
            assert!(!outcome.should_dispatch());

            assert_eq!(repo.documents_for_series(&series.id).unwrap().len(), 1);
        }
    }

    #[test]
    fn test_claim_document_reclaims_failed() {
        for repo in create_test_repos() {
            let now = at(2025, 2, 1, 0);
            let series = series_due_at(now);
            repo.insert_series(&series).unwrap();

            let doc = GeneratedDocument::for_cycle(&series, now, now);
            repo.claim_document(&doc, now - Duration::hours(1)).unwrap();
            repo.fail_document(&doc.id, "renderer unavailable", now).unwrap();

            let failed = repo.get_document(&doc.id).unwrap().unwrap();
            assert_eq!(failed.status, DocumentStatus::Failed);
            assert_eq!(failed.last_error.as_deref(), Some("renderer unavailable"));

            let retry = GeneratedDocument::for_cycle(&series, now, now);
            let outcome = repo.claim_document(&retry, now - Duration::hours(1)).unwrap();
            match outcome {
                ClaimOutcome::Reclaimed(doc) => {
                    assert_eq!(doc.attempts, 2);
                    assert_eq!(doc.status, DocumentStatus::Pending);
                    assert!(doc.last_error.is_none());
                }
                other => panic!("Unexpected outcome: {other:?}"),
            }
        }
    }

    #[test]
    fn test_claim_document_reclaims_stale_pending() {
        for repo in create_test_repos() {
            let claimed_at = at(2025, 2, 1, 0);
            let series = series_due_at(claimed_at);
            repo.insert_series(&series).unwrap();

            let doc = GeneratedDocument::for_cycle(&series, claimed_at, claimed_at);
            repo.claim_document(&doc, claimed_at - Duration::hours(1)).unwrap();

            let later = claimed_at + Duration::hours(2);
            let retry = GeneratedDocument::for_cycle(&series, claimed_at, later);
            let outcome = repo.claim_document(&retry, later - Duration::hours(1)).unwrap();
            assert!(matches!(outcome, ClaimOutcome::Reclaimed(_)));
        }
    }

    #[test]
    fn test_end_condition_round_trip() {
        for repo in create_test_repos() {
            let mut series = series_due_at(at(2025, 2, 1, 0));
            let end = EndCondition::after_count(6);
            series.end_type = end.end_type;
            series.end_count = end.end_count;
            repo.insert_series(&series).unwrap();

            let loaded = repo.get_series(&series.id).unwrap().unwrap();
            assert_eq!(loaded.end_condition(), end);
        }
    }
}
