//! Idempotent document generation
//!
//! Each due series yields exactly one [`GeneratedDocument`] per sequence
//! number. The storage claim on (series id, sequence) is the only guard
//! against duplicates: overlapping ticks, redelivered work and manual
//! retries all collapse onto the same row.
//!
//! # Flow
//!
//! ```text
//!   due series ──► claim (series, sequence)
//!                    │
//!       ┌────────────┼───────────────┬───────────────┐
//!       ▼            ▼               ▼               ▼
//!    Claimed     Reclaimed     AlreadyGenerated   InFlight
//!       └─────┬──────┘               │               │
//!             ▼                      ▼               ▼
//!     dispatch (timeout)       advance series      skip
//!        │         │
//!        ▼         ▼
//!     success    failure ──► failures += 1, auto-pause at threshold
//!        │
//!        ▼
//!   counter += 1, next date, completion check
//! ```
//!
//! Series state changes go through `SeriesRepository::modify_series`, and
//! the transition functions refuse to act on a sequence that does not match
//! the series' counter, so a late or duplicate observer is a no-op.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use super::error::{SchedulerError, SchedulerResult};
use super::frequency::{advance_to_future, is_completed, next_scheduled_date};
use super::scanner::scan_due;
use super::trigger::SchedulerEvent;
use crate::config::SchedulerConfig;
use crate::error::{ErrorCategory, RecurErrorTrait, Result};
use crate::metrics;
use crate::models::{GeneratedDocument, RecurringSeries, SeriesStatus, TemplatePayload};
use crate::storage::{ClaimOutcome, SeriesRepository};

// ============================================================================
// Work Items and Executors
// ============================================================================

/// One "generate this cycle" request for the external executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationWorkItem {
    pub document_id: String,
    pub series_id: String,
    pub team_id: String,
    pub user_id: String,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub sequence: u32,
    pub attempt: u32,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub payload: TemplatePayload,
    pub scheduled_at: DateTime<Utc>,
    pub issue_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
}

impl GenerationWorkItem {
    /// Work item for a claimed document
    pub fn new(series: &RecurringSeries, document: &GeneratedDocument) -> Self {
        Self {
            document_id: document.id.clone(),
            series_id: series.id.clone(),
            team_id: series.team_id.clone(),
            user_id: series.user_id.clone(),
            customer_id: series.customer_id.clone(),
            customer_name: series.customer_name.clone(),
            sequence: document.sequence,
            attempt: document.attempts,
            amount: document.amount,
            currency: document.currency.clone(),
            payload: document.payload.clone(),
            scheduled_at: document.scheduled_at,
            issue_date: document.issue_date,
            due_date: document.due_date,
        }
    }
}

/// Renders and sends generated documents
///
/// Delivery may be at-least-once; executors do not need to deduplicate.
#[async_trait]
pub trait DocumentExecutor: Send + Sync {
    /// Handle one work item; `Ok` acknowledges the document as generated
    async fn execute(&self, item: GenerationWorkItem) -> SchedulerResult<()>;

    /// Name used in logs
    fn name(&self) -> &str {
        "executor"
    }
}

/// Executor that logs and acknowledges every item
#[derive(Debug, Clone, Default)]
pub struct LogExecutor;

#[async_trait]
impl DocumentExecutor for LogExecutor {
    async fn execute(&self, item: GenerationWorkItem) -> SchedulerResult<()> {
        tracing::info!(
            document_id = %item.document_id,
            series_id = %item.series_id,
            sequence = item.sequence,
            attempt = item.attempt,
            issue_date = %item.issue_date.date_naive(),
            due_date = %item.due_date.date_naive(),
            "Generated document"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Executor that queues items for a separate worker
///
/// Acknowledges once the item is queued.
#[derive(Debug, Clone)]
pub struct ChannelExecutor {
    sender: mpsc::Sender<GenerationWorkItem>,
}

impl ChannelExecutor {
    /// Create an executor and the receiving end of its queue
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<GenerationWorkItem>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DocumentExecutor for ChannelExecutor {
    async fn execute(&self, item: GenerationWorkItem) -> SchedulerResult<()> {
        self.sender
            .send(item)
            .await
            .map_err(|e| SchedulerError::dispatch_failed(&e.0.series_id, "work queue closed"))
    }

    fn name(&self) -> &str {
        "channel"
    }
}

// ============================================================================
// Series Transitions
// ============================================================================

/// Advance a series after document `completed_sequence` was generated
///
/// Returns `None` when the sequence is not the series' next one (already
/// advanced by another observer) or the series is terminal. The next date
/// is computed from the previous scheduled date, then pushed past `now` if
/// cycles were missed.
pub fn on_generation_success(
    series: &RecurringSeries,
    completed_sequence: u32,
    now: DateTime<Utc>,
    max_catch_up: u32,
) -> SchedulerResult<Option<RecurringSeries>> {
    if series.status.is_terminal() || series.next_sequence() != completed_sequence {
        return Ok(None);
    }

    let params = series.schedule_params()?;
    let generated = series.invoices_generated + 1;
    let base = series.next_scheduled_at.unwrap_or(now);
    let candidate = next_scheduled_date(&params, base)?;
    let advance = advance_to_future(&params, candidate, now, max_catch_up)?;

    if advance.hit_safety_limit {
        tracing::warn!(
            series_id = %series.id,
            max_catch_up,
            "Catch-up limit reached, rescheduling from now"
        );
    } else if advance.skipped > 0 {
        tracing::info!(
            series_id = %series.id,
            skipped = advance.skipped,
            "Skipped missed cycles"
        );
    }

    let mut updated = series.clone();
    updated.invoices_generated = generated;
    updated.consecutive_failures = 0;
    updated.last_generated_at = Some(now);
    updated.updated_at = now;

    if is_completed(&series.end_condition(), generated, Some(advance.next)) {
        updated.status = SeriesStatus::Completed;
        updated.next_scheduled_at = None;
    } else {
        updated.next_scheduled_at = Some(advance.next);
    }

    Ok(Some(updated))
}

/// Record a failed attempt at `failed_sequence`
///
/// `next_scheduled_at` is left alone so the cycle is retried on the next
/// tick. Reaching `threshold` consecutive failures pauses the series.
pub fn on_generation_failure(
    series: &RecurringSeries,
    failed_sequence: u32,
    now: DateTime<Utc>,
    threshold: u32,
) -> Option<RecurringSeries> {
    if series.status != SeriesStatus::Active || series.next_sequence() != failed_sequence {
        return None;
    }

    let mut updated = series.clone();
    updated.consecutive_failures += 1;
    updated.updated_at = now;

    if updated.consecutive_failures >= threshold {
        updated.status = SeriesStatus::Paused;
    }

    Some(updated)
}

// ============================================================================
// Outcomes
// ============================================================================

/// Why a due series produced no document this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotDue,
    InFlight,
    DryRun,
    /// Paused, canceled or advanced after the batch was read
    SeriesChanged,
}

/// Result of processing one series
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesOutcome {
    /// Document dispatched and acknowledged
    Generated {
        document_id: String,
        sequence: u32,
        completed: bool,
    },
    /// Document already existed; series advanced without dispatch
    Reconciled { sequence: u32, completed: bool },
    Skipped(SkipReason),
    Failed {
        sequence: u32,
        error: String,
        auto_paused: bool,
    },
}

/// Per-series error in a tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickError {
    pub series_id: String,
    pub category: String,
    pub error: String,
}

/// Summary of one scheduler tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub due: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<TickError>,
    /// More due series were left for the next tick
    pub has_more: bool,
    pub disabled: bool,
    pub dry_run: bool,
}

impl TickReport {
    /// Format as display string
    pub fn display(&self) -> String {
        let mut output = String::from("Tick Report\n");
        output.push_str(&format!("{:-<40}\n", ""));

        if self.disabled {
            output.push_str("Scheduler disabled\n");
            return output;
        }

        if self.dry_run {
            output.push_str("Dry run: nothing was generated\n");
        }
        output.push_str(&format!("Due: {}\n", self.due));
        output.push_str(&format!("Processed: {}\n", self.processed));
        output.push_str(&format!("Skipped: {}\n", self.skipped));
        output.push_str(&format!("Failed: {}\n", self.failed));
        output.push_str(&format!("More Pending: {}\n", self.has_more));

        for err in &self.errors {
            output.push_str(&format!("  [{}] {}: {}\n", err.category, err.series_id, err.error));
        }

        output
    }

    fn record(&mut self, series_id: String, result: Result<SeriesOutcome>) {
        match result {
            Ok(SeriesOutcome::Generated { .. } | SeriesOutcome::Reconciled { .. }) => {
                self.processed += 1
            }
            Ok(SeriesOutcome::Skipped(_)) => self.skipped += 1,
            Ok(SeriesOutcome::Failed { error, .. }) => {
                self.failed += 1;
                self.errors.push(TickError {
                    series_id,
                    category: ErrorCategory::Dispatch.as_str().to_string(),
                    error,
                });
            }
            Err(e) => {
                self.failed += 1;
                self.errors.push(TickError {
                    series_id,
                    category: e.category().as_str().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
}

// ============================================================================
// Generation Engine
// ============================================================================

/// Claims, dispatches and records document generation for due series
pub struct GenerationEngine<R: SeriesRepository + ?Sized = dyn SeriesRepository> {
    repo: Arc<R>,
    executor: Arc<dyn DocumentExecutor>,
    config: SchedulerConfig,
    events: Option<broadcast::Sender<SchedulerEvent>>,
}

impl<R: SeriesRepository + ?Sized> GenerationEngine<R> {
    /// Create an engine
    pub fn new(repo: Arc<R>, executor: Arc<dyn DocumentExecutor>, config: SchedulerConfig) -> Self {
        Self {
            repo,
            executor,
            config,
            events: None,
        }
    }

    /// Publish outcomes on an event channel
    pub fn with_events(mut self, sender: broadcast::Sender<SchedulerEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Scheduler settings in use
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Underlying repository
    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(sender) = &self.events {
            // No subscribers is fine
            let _ = sender.send(event);
        }
    }

    fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.config.dispatch_timeout_secs)
    }

    /// Pending claims older than this are considered abandoned
    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = self.config.dispatch_timeout_secs.saturating_mul(2).max(60);
        i64::try_from(window)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Run one generation cycle for a single series
    pub async fn process_series(
        &self,
        series: RecurringSeries,
        now: DateTime<Utc>,
    ) -> Result<SeriesOutcome> {
        let Some(scheduled_at) = series.next_scheduled_at.filter(|_| series.is_due(now)) else {
            return Ok(SeriesOutcome::Skipped(SkipReason::NotDue));
        };

        // A series whose next date cannot be computed must not generate
        if !series.frequency.is_schedulable() {
            let err = SchedulerError::unsupported_frequency(series.frequency.as_str());
            return self.record_failure(&series, series.next_sequence(), &err, now);
        }
        if let Err(err) = series.schedule_params() {
            return self.record_failure(&series, series.next_sequence(), &err, now);
        }

        let document = GeneratedDocument::for_cycle(&series, scheduled_at, now);

        match self.repo.claim_document(&document, self.stale_before(now))? {
            ClaimOutcome::AlreadyGenerated(existing) => {
                tracing::info!(
                    series_id = %series.id,
                    sequence = existing.sequence,
                    "Document already generated, advancing series"
                );
                metrics::record_document_reconciled();
                let completed = self.record_success(&series.id, existing.sequence, now)?;
                Ok(SeriesOutcome::Reconciled {
                    sequence: existing.sequence,
                    completed,
                })
            }
            ClaimOutcome::InFlight(existing) => {
                tracing::debug!(
                    series_id = %series.id,
                    sequence = existing.sequence,
                    "Document generation in flight elsewhere"
                );
                Ok(SeriesOutcome::Skipped(SkipReason::InFlight))
            }
            ClaimOutcome::SeriesChanged(current) => {
                tracing::debug!(
                    series_id = %series.id,
                    status = %current.status,
                    sequence = document.sequence,
                    "Series changed since scan, not generating"
                );
                Ok(SeriesOutcome::Skipped(SkipReason::SeriesChanged))
            }
            ClaimOutcome::Claimed(claimed) | ClaimOutcome::Reclaimed(claimed) => {
                self.dispatch(&series, claimed, now).await
            }
        }
    }

    async fn dispatch(
        &self,
        series: &RecurringSeries,
        document: GeneratedDocument,
        now: DateTime<Utc>,
    ) -> Result<SeriesOutcome> {
        let item = GenerationWorkItem::new(series, &document);
        let timeout = self.dispatch_timeout();

        tracing::debug!(
            series_id = %series.id,
            document_id = %document.id,
            sequence = document.sequence,
            attempt = document.attempts,
            executor = self.executor.name(),
            "Dispatching document"
        );

        let result = match tokio::time::timeout(timeout, self.executor.execute(item)).await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::DispatchTimeout {
                series_id: series.id.clone(),
                timeout_secs: timeout.as_secs(),
            }),
        };

        match result {
            Ok(()) => {
                self.repo.complete_document(&document.id, now)?;
                metrics::record_document_generated();
                self.emit(SchedulerEvent::DocumentGenerated {
                    series_id: series.id.clone(),
                    document_id: document.id.clone(),
                    sequence: document.sequence,
                    at: now,
                });

                let completed = self.record_success(&series.id, document.sequence, now)?;
                Ok(SeriesOutcome::Generated {
                    document_id: document.id,
                    sequence: document.sequence,
                    completed,
                })
            }
            Err(err) => {
                self.repo.fail_document(&document.id, &err.to_string(), now)?;
                self.record_failure(series, document.sequence, &err, now)
            }
        }
    }

    /// Apply the success transition; returns whether the series completed
    fn record_success(&self, series_id: &str, sequence: u32, now: DateTime<Utc>) -> Result<bool> {
        let max_catch_up = self.config.catch_up_max_iterations;
        let updated = self.repo.modify_series(series_id, &|current| {
            Ok(on_generation_success(current, sequence, now, max_catch_up)?)
        })?;

        let Some(updated) = updated else {
            tracing::debug!(series_id = %series_id, sequence, "Series already advanced");
            return Ok(false);
        };

        let completed = updated.status == SeriesStatus::Completed;
        if completed {
            metrics::record_series_completed();
            self.emit(SchedulerEvent::SeriesCompleted {
                series_id: series_id.to_string(),
                documents: updated.invoices_generated,
                at: now,
            });
            tracing::info!(
                series_id = %series_id,
                documents = updated.invoices_generated,
                "Series completed"
            );
        } else {
            tracing::info!(
                series_id = %series_id,
                sequence,
                next_scheduled_at = ?updated.next_scheduled_at,
                "Series advanced"
            );
        }

        Ok(completed)
    }

    fn record_failure(
        &self,
        series: &RecurringSeries,
        sequence: u32,
        err: &SchedulerError,
        now: DateTime<Utc>,
    ) -> Result<SeriesOutcome> {
        metrics::record_generation_failure(err.category().as_str());
        tracing::warn!(
            series_id = %series.id,
            sequence,
            error = %err,
            "Document generation failed"
        );

        let threshold = self.config.max_consecutive_failures;
        let updated = self
            .repo
            .modify_series(&series.id, &|current| {
                Ok(on_generation_failure(current, sequence, now, threshold))
            })?;

        self.emit(SchedulerEvent::GenerationFailed {
            series_id: series.id.clone(),
            sequence,
            error: err.to_string(),
            at: now,
        });

        let auto_paused = updated
            .as_ref()
            .is_some_and(|s| s.status == SeriesStatus::Paused);

        if let Some(updated) = updated.filter(|_| auto_paused) {
            metrics::record_auto_pause();
            self.emit(SchedulerEvent::SeriesAutoPaused {
                series_id: series.id.clone(),
                consecutive_failures: updated.consecutive_failures,
                at: now,
            });
            tracing::warn!(
                series_id = %series.id,
                consecutive_failures = updated.consecutive_failures,
                "Series paused after repeated failures"
            );
        }

        Ok(SeriesOutcome::Failed {
            sequence,
            error: err.to_string(),
            auto_paused,
        })
    }

    /// Process one batch of due series
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        if !self.config.enabled {
            tracing::debug!("Scheduler disabled, skipping tick");
            return Ok(TickReport {
                disabled: true,
                ..Default::default()
            });
        }

        let _timer = metrics::start_tick_timer();
        let batch = scan_due(self.repo.as_ref(), now, self.config.due_batch_size)?;
        metrics::update_due_state(batch.len(), batch.has_more);

        let mut report = TickReport {
            due: batch.len(),
            has_more: batch.has_more,
            dry_run: self.config.dry_run,
            ..Default::default()
        };

        if self.config.dry_run {
            for series in &batch.series {
                tracing::info!(
                    series_id = %series.id,
                    sequence = series.next_sequence(),
                    scheduled_at = ?series.next_scheduled_at,
                    "Dry run: would generate document"
                );
            }
            report.skipped = batch.len();
            return Ok(report);
        }

        let results: Vec<(String, Result<SeriesOutcome>)> = stream::iter(batch.series)
            .map(|series| async move {
                let id = series.id.clone();
                (id, self.process_series(series, now).await)
            })
            .buffer_unordered(self.config.max_concurrent_dispatches.max(1))
            .collect()
            .await;

        for (series_id, result) in results {
            if let Err(e) = &result {
                tracing::error!(series_id = %series_id, error = %e, "Failed to process series");
            }
            report.record(series_id, result);
        }

        tracing::info!(
            due = report.due,
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            has_more = report.has_more,
            "Tick completed"
        );

        Ok(report)
    }
}
