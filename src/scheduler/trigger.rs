//! Scheduler trigger system
//!
//! Drives the generation engine and the upcoming-notification run on a
//! fixed polling interval and broadcasts what happened to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::time::MissedTickBehavior;

use super::generation::{DocumentExecutor, GenerationEngine, TickReport};
use super::notify::{send_upcoming_notifications, Notifier, NotifyReport};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::storage::SeriesRepository;

// ============================================================================
// Scheduler Events
// ============================================================================

/// Events emitted by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A document was dispatched and acknowledged
    DocumentGenerated {
        series_id: String,
        document_id: String,
        sequence: u32,
        at: DateTime<Utc>,
    },

    /// A series reached its end condition
    SeriesCompleted {
        series_id: String,
        documents: u32,
        at: DateTime<Utc>,
    },

    /// A series hit the consecutive failure threshold
    SeriesAutoPaused {
        series_id: String,
        consecutive_failures: u32,
        at: DateTime<Utc>,
    },

    /// One generation attempt failed
    GenerationFailed {
        series_id: String,
        sequence: u32,
        error: String,
        at: DateTime<Utc>,
    },

    /// Upcoming-due notices were acknowledged
    NotificationsSent { count: usize, at: DateTime<Utc> },

    /// A full tick finished
    TickCompleted { report: TickReport, at: DateTime<Utc> },
}

/// Outcome of one generation tick plus notification run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub tick: TickReport,
    pub notifications: NotifyReport,
}

impl CycleReport {
    /// Format as display string
    pub fn display(&self) -> String {
        let mut output = self.tick.display();
        output.push_str(&format!(
            "Notified: {} of {} selected{}\n",
            self.notifications.notified,
            self.notifications.selected,
            if self.notifications.has_more { " (more pending)" } else { "" }
        ));
        output
    }
}

// ============================================================================
// Scheduler Trigger
// ============================================================================

/// Polling loop around the generation engine
pub struct SchedulerTrigger<R: SeriesRepository + ?Sized = dyn SeriesRepository> {
    engine: GenerationEngine<R>,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
    event_sender: broadcast::Sender<SchedulerEvent>,
    is_running: Arc<RwLock<bool>>,
    last_tick_at: Arc<RwLock<Option<DateTime<Utc>>>>,
    ticks_completed: Arc<RwLock<u64>>,
}

impl<R: SeriesRepository + ?Sized> SchedulerTrigger<R> {
    /// Create a new trigger
    pub fn new(
        repo: Arc<R>,
        executor: Arc<dyn DocumentExecutor>,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        let engine =
            GenerationEngine::new(repo, executor, config.clone()).with_events(event_sender.clone());

        Self {
            engine,
            notifier,
            config,
            event_sender,
            is_running: Arc::new(RwLock::new(false)),
            last_tick_at: Arc::new(RwLock::new(None)),
            ticks_completed: Arc::new(RwLock::new(0)),
        }
    }

    /// Subscribe to scheduler events
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_sender.subscribe()
    }

    /// Engine driven by this trigger
    pub fn engine(&self) -> &GenerationEngine<R> {
        &self.engine
    }

    /// Run generation then notifications once at `now`
    ///
    /// A failing notifier is logged and does not fail the cycle.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let tick = self.engine.run_tick(now).await?;

        let notifications = if tick.disabled || tick.dry_run {
            NotifyReport::default()
        } else {
            match send_upcoming_notifications(
                self.engine.repository().as_ref(),
                self.notifier.as_ref(),
                now,
                self.config.lookahead_hours,
                self.config.notification_batch_size,
            )
            .await
            {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!(error = %e, "Upcoming notifications failed, will retry next tick");
                    NotifyReport::default()
                }
            }
        };

        if notifications.notified > 0 {
            let _ = self.event_sender.send(SchedulerEvent::NotificationsSent {
                count: notifications.notified,
                at: now,
            });
        }

        let _ = self.event_sender.send(SchedulerEvent::TickCompleted {
            report: tick.clone(),
            at: now,
        });

        *self.last_tick_at.write().await = Some(now);
        *self.ticks_completed.write().await += 1;

        Ok(CycleReport {
            tick,
            notifications,
        })
    }

    /// Start the trigger loop (runs until stopped)
    ///
    /// The first tick runs immediately. Errors of a single tick are logged
    /// and the loop keeps going.
    pub async fn start(&self) -> Result<()> {
        *self.is_running.write().await = true;

        let period = std::time::Duration::from_secs(self.config.tick_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            tick_interval_secs = period.as_secs(),
            enabled = self.config.enabled,
            dry_run = self.config.dry_run,
            "Scheduler started"
        );

        while *self.is_running.read().await {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        tracing::error!(error = %e, "Scheduler tick failed");
                    }
                }
                _ = self.wait_for_stop() => {
                    break;
                }
            }
        }

        tracing::info!("Scheduler stopped");
        Ok(())
    }

    /// Stop the trigger loop
    pub async fn stop(&self) {
        *self.is_running.write().await = false;
    }

    /// Check if trigger is running
    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    // Internal: Wait for stop signal
    async fn wait_for_stop(&self) {
        loop {
            if !*self.is_running.read().await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    /// Get trigger status
    pub async fn status(&self) -> TriggerStatus {
        TriggerStatus {
            is_running: *self.is_running.read().await,
            enabled: self.config.enabled,
            dry_run: self.config.dry_run,
            tick_interval_secs: self.config.tick_interval_secs,
            last_tick_at: *self.last_tick_at.read().await,
            ticks_completed: *self.ticks_completed.read().await,
        }
    }
}

/// Trigger status information
#[derive(Debug, Clone)]
pub struct TriggerStatus {
    pub is_running: bool,
    pub enabled: bool,
    pub dry_run: bool,
    pub tick_interval_secs: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub ticks_completed: u64,
}

impl TriggerStatus {
    /// Format as display string
    pub fn display(&self) -> String {
        let mut output = String::from("Trigger Status\n");
        output.push_str(&format!("{:-<40}\n", ""));
        output.push_str(&format!("Running: {}\n", self.is_running));
        output.push_str(&format!("Enabled: {}\n", self.enabled));
        output.push_str(&format!("Dry Run: {}\n", self.dry_run));
        output.push_str(&format!("Tick Interval: {}s\n", self.tick_interval_secs));

        match self.last_tick_at {
            Some(at) => output.push_str(&format!("Last Tick: {}\n", at.to_rfc3339())),
            None => output.push_str("Last Tick: never\n"),
        }
        output.push_str(&format!("Ticks Completed: {}\n", self.ticks_completed));

        output
    }
}

// ============================================================================
// Tests
// ============================================================================
