use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use recur::config::Config;
use recur::scheduler::{
    send_upcoming_notifications, LogExecutor, LogNotifier, SchedulerEvent, SchedulerTrigger,
};
use recur::storage::open_repository;

fn build_trigger(config: &Config) -> Result<SchedulerTrigger> {
    let repo = open_repository(&config.database).context("Failed to open series database")?;
    Ok(SchedulerTrigger::new(
        repo,
        Arc::new(LogExecutor),
        Arc::new(LogNotifier),
        config.scheduler.clone(),
    ))
}

/// Run the polling loop until Ctrl-C
pub async fn run(config: Config) -> Result<()> {
    if let Err(e) = recur::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics registration failed, continuing without metrics");
    }

    let trigger = Arc::new(build_trigger(&config)?);

    println!("Starting Recurring Scheduler");
    println!("============================");
    println!("{}", trigger.status().await.display());

    let mut events = trigger.subscribe();
    let event_logger = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SchedulerEvent::SeriesAutoPaused {
                    series_id,
                    consecutive_failures,
                    ..
                } => {
                    tracing::warn!(
                        series_id = %series_id,
                        consecutive_failures,
                        "Series paused after repeated failures"
                    );
                }
                SchedulerEvent::SeriesCompleted {
                    series_id,
                    documents,
                    ..
                } => {
                    tracing::info!(series_id = %series_id, documents, "Series completed");
                }
                other => tracing::debug!(event = ?other, "Scheduler event"),
            }
        }
    });

    let stopper = Arc::clone(&trigger);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping scheduler");
            stopper.stop().await;
        }
    });

    trigger.start().await?;
    event_logger.abort();

    println!("{}", trigger.status().await.display());
    Ok(())
}

/// Run one cycle at `now`
pub async fn tick(config: Config, now: DateTime<Utc>) -> Result<()> {
    let trigger = build_trigger(&config)?;
    let report = trigger.run_once(now).await?;

    println!("Scheduler Tick at {}", now.to_rfc3339());
    println!("================================");
    print!("{}", report.display());

    for error in &report.tick.errors {
        println!("  ✗ {} [{}]: {}", error.series_id, error.category, error.error);
    }
    Ok(())
}

/// Send one batch of upcoming-due notices
pub async fn notify(config: Config, lookahead_hours: Option<u32>) -> Result<()> {
    let repo = open_repository(&config.database).context("Failed to open series database")?;
    let lookahead = lookahead_hours.unwrap_or(config.scheduler.lookahead_hours);

    let report = send_upcoming_notifications(
        repo.as_ref(),
        &LogNotifier,
        Utc::now(),
        lookahead,
        config.scheduler.notification_batch_size,
    )
    .await?;

    println!("Upcoming Notifications ({lookahead}h)");
    println!("================================");
    println!("Selected: {}", report.selected);
    println!("Notified: {}", report.notified);
    if report.has_more {
        println!("More series pending; they will be picked up on the next run.");
    }
    Ok(())
}

/// Print metrics in the Prometheus text format
pub async fn metrics(config: Config, run_tick: bool) -> Result<()> {
    recur::metrics::init_metrics()
        .map_err(|e| anyhow::anyhow!("Failed to register metrics: {e}"))?;

    if run_tick {
        let trigger = build_trigger(&config)?;
        trigger.run_once(Utc::now()).await?;
    }

    let output = recur::metrics::encode_metrics()
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {e}"))?;
    print!("{output}");
    Ok(())
}
