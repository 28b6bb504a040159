//! Integration tests for the scheduler trigger
//!
//! These tests verify the complete cycle of:
//! - Generation followed by upcoming-due notifications
//! - Event broadcasting to subscribers
//! - Lifecycle operations and lookups on persisted series
//! - Forecasting over stored series

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

use recur::config::SchedulerConfig;
use recur::models::{EndCondition, Frequency, SeriesDraft, SeriesPatch, SeriesStatus};
use recur::scheduler::{
    project_forecast, LifecycleManager, LogExecutor, Notifier, SchedulerEvent, SchedulerResult,
    SchedulerTrigger, UpcomingDue,
};
use recur::storage::{SeriesFilter, SharedSeriesRepository};

use common::{at, monthly_draft, sqlite_repo};

/// Notifier that remembers every series it was told about
#[derive(Default)]
struct RecordingNotifier {
    seen: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, batch: &[UpcomingDue]) -> SchedulerResult<()> {
        let mut seen = self.seen.lock().unwrap();
        seen.extend(batch.iter().map(|due| due.series_id.clone()));
        Ok(())
    }
}

fn trigger(
    repo: &SharedSeriesRepository,
    notifier: Arc<RecordingNotifier>,
) -> SchedulerTrigger {
    SchedulerTrigger::new(
        repo.clone(),
        Arc::new(LogExecutor),
        notifier,
        SchedulerConfig::default(),
    )
}

fn create(repo: &SharedSeriesRepository, draft: SeriesDraft, now: DateTime<Utc>) -> String {
    LifecycleManager::new(repo.clone())
        .create(draft, now)
        .unwrap()
        .id
}

// ============================================================================
// Trigger Cycle
// ============================================================================

#[tokio::test]
async fn test_cycle_generates_then_notifies() {
    let (_dir, repo) = sqlite_repo();
    let now = at(2025, 1, 1);

    let due_now = create(&repo, monthly_draft(), now);
    let due_tomorrow = create(
        &repo,
        SeriesDraft::new("team-1", "user-1", Frequency::MonthlyDate)
            .day(2)
            .issue_date(now + Duration::hours(20)),
        now,
    );

    let notifier = Arc::new(RecordingNotifier::default());
    let trigger = trigger(&repo, notifier.clone());
    let mut events = trigger.subscribe();

    let report = trigger.run_once(now).await.unwrap();
    assert_eq!(report.tick.processed, 1);
    assert_eq!(report.notifications.notified, 1);
    assert_eq!(notifier.seen(), vec![due_tomorrow.clone()]);

    let mut generated = Vec::new();
    let mut saw_tick = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SchedulerEvent::DocumentGenerated { series_id, .. } => generated.push(series_id),
            SchedulerEvent::TickCompleted { report, .. } => {
                assert_eq!(report.processed, 1);
                saw_tick = true;
            }
            _ => {}
        }
    }
    assert_eq!(generated, vec![due_now]);
    assert!(saw_tick);

    // Already notified for this cycle
    let report = trigger
        .run_once(now + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(report.notifications.selected, 0);
    assert_eq!(notifier.seen().len(), 1);

    let status = trigger.status().await;
    assert_eq!(status.ticks_completed, 2);
    assert!(!status.is_running);
}

#[tokio::test]
async fn test_next_cycle_is_notified_again() {
    let (_dir, repo) = sqlite_repo();
    let now = at(2025, 1, 1);
    let first_due = now + Duration::hours(20);
    let id = create(
        &repo,
        SeriesDraft::new("team-1", "user-1", Frequency::Weekly)
            .day(4)
            .issue_date(first_due),
        now,
    );

    let notifier = Arc::new(RecordingNotifier::default());
    let trigger = trigger(&repo, notifier.clone());

    trigger.run_once(now).await.unwrap();
    trigger.run_once(first_due).await.unwrap();

    let series = repo.get_series(&id).unwrap().unwrap();
    assert_eq!(series.invoices_generated, 1);
    let next = series.next_scheduled_at.unwrap();

    trigger
        .run_once(next - Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(notifier.seen(), vec![id.clone(), id]);
}

#[tokio::test]
async fn test_disabled_trigger_does_nothing() {
    let (_dir, repo) = sqlite_repo();
    let now = at(2025, 1, 1);
    let id = create(&repo, monthly_draft(), now);

    let notifier = Arc::new(RecordingNotifier::default());
    let trigger = SchedulerTrigger::new(
        repo.clone(),
        Arc::new(LogExecutor),
        notifier.clone(),
        SchedulerConfig {
            enabled: false,
            ..Default::default()
        },
    );

    let report = trigger.run_once(now).await.unwrap();
    assert!(report.tick.disabled);
    assert!(repo.documents_for_series(&id).unwrap().is_empty());
    assert!(notifier.seen().is_empty());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_paused_series_skipped_until_resumed() {
    let (_dir, repo) = sqlite_repo();
    let now = at(2025, 1, 1);
    let manager = LifecycleManager::new(repo.clone());
    let id = create(&repo, monthly_draft(), now);

    manager.pause(&id, now).unwrap();

    let trigger = trigger(&repo, Arc::new(RecordingNotifier::default()));
    let report = trigger.run_once(now).await.unwrap();
    assert_eq!(report.tick.due, 0);

    let resumed = manager.resume(&id, at(2025, 3, 15)).unwrap();
    assert_eq!(resumed.next_scheduled_at, Some(at(2025, 4, 1)));

    let report = trigger.run_once(at(2025, 4, 1)).await.unwrap();
    assert_eq!(report.tick.processed, 1);
}

#[test]
fn test_update_schedule_and_document_info() {
    let (_dir, repo) = sqlite_repo();
    let now = at(2025, 1, 10);
    let manager = LifecycleManager::new(repo.clone());
    let id = create(
        &repo,
        monthly_draft().ending(EndCondition::after_count(12)),
        now,
    );

    let patch = SeriesPatch {
        frequency_day: Some(20),
        ..Default::default()
    };
    let updated = manager.update(&id, &patch, now).unwrap();
    assert_eq!(updated.frequency_day, Some(20));
    assert_eq!(updated.next_scheduled_at, Some(at(2025, 2, 20)));

    let listed = manager
        .list(&SeriesFilter::with_status(SeriesStatus::Active))
        .unwrap();
    assert_eq!(listed.len(), 1);

    let preview = manager.upcoming(&id, Some(3), now).unwrap();
    assert_eq!(preview.occurrences.len(), 3);
    assert_eq!(preview.summary.total_count, Some(12));
    assert_eq!(preview.summary.total_amount, Some(12.0 * 250.0));

    assert!(manager.document_info("missing").unwrap().is_none());

    manager.cancel(&id, now).unwrap();
    assert!(manager.pause(&id, now).is_err());
}

#[tokio::test]
async fn test_document_info_reports_position() {
    let (_dir, repo) = sqlite_repo();
    let now = at(2025, 1, 1);
    let manager = LifecycleManager::new(repo.clone());
    let id = create(
        &repo,
        monthly_draft().ending(EndCondition::after_count(6)),
        now,
    );

    trigger(&repo, Arc::new(RecordingNotifier::default()))
        .run_once(now)
        .await
        .unwrap();

    let documents = repo.documents_for_series(&id).unwrap();
    let info = manager.document_info(&documents[0].id).unwrap().unwrap();
    assert_eq!(info.series_id, id);
    assert_eq!(info.position(), "1 of 6");
    assert_eq!(info.status, SeriesStatus::Active);
}

// ============================================================================
// Forecast
// ============================================================================

#[test]
fn test_forecast_over_stored_series() {
    let (_dir, repo) = sqlite_repo();
    let now = at(2025, 1, 1);
    create(&repo, monthly_draft(), now);
    create(
        &repo,
        SeriesDraft::new("team-2", "user-2", Frequency::Quarterly)
            .day(1)
            .priced(900.0, "EUR"),
        now,
    );
    let canceled = create(&repo, monthly_draft(), now);
    LifecycleManager::new(repo.clone())
        .cancel(&canceled, now)
        .unwrap();

    let active = repo
        .list_series(&SeriesFilter::with_status(SeriesStatus::Active))
        .unwrap();
    let forecast = project_forecast(&active, now, 6).unwrap();

    assert_eq!(forecast.series_projected, 2);
    assert_eq!(forecast.months.len(), 7);
    assert_eq!(forecast.months[0].by_currency["USD"], 250.0);
    assert_eq!(forecast.months[0].by_currency["EUR"], 900.0);
    assert_eq!(forecast.months[3].by_currency["EUR"], 900.0);
}
