//! Prometheus metrics for the recur scheduler
//!
//! This module provides metrics tracking for:
//! - Generation: documents generated, dispatch failures by category, auto-pauses, completions
//! - Notifications: upcoming-due notices sent
//! - Ticks: duration, due series seen, backlog flag
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all scheduler metrics
struct SchedulerMetrics {
    documents_generated: Counter,
    documents_reconciled: Counter,
    generation_failures: CounterVec,
    series_auto_paused: Counter,
    series_completed: Counter,
    notifications_sent: Counter,
    tick_duration: Histogram,
    due_series: Gauge,
    backlog: Gauge,
}

/// Global storage for scheduler metrics
static SCHEDULER_METRICS: OnceLock<SchedulerMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, subsequent metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = recur::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = SchedulerMetrics {
        documents_generated: register_counter!(
            "recur_documents_generated_total",
            "Total documents dispatched and acknowledged"
        )?,
        documents_reconciled: register_counter!(
            "recur_documents_reconciled_total",
            "Total cycles advanced from an already generated document"
        )?,
        generation_failures: register_counter_vec!(
            "recur_generation_failures_total",
            "Total failed generation attempts by error category",
            &["category"]
        )?,
        series_auto_paused: register_counter!(
            "recur_series_auto_paused_total",
            "Total series paused after repeated failures"
        )?,
        series_completed: register_counter!(
            "recur_series_completed_total",
            "Total series that reached their end condition"
        )?,
        notifications_sent: register_counter!(
            "recur_upcoming_notifications_sent_total",
            "Total upcoming-due notices acknowledged by the notifier"
        )?,
        tick_duration: register_histogram!(
            "recur_tick_duration_seconds",
            "Scheduler tick duration in seconds",
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        )?,
        due_series: register_gauge!(
            "recur_due_series",
            "Due series picked up by the last tick"
        )?,
        backlog: register_gauge!(
            "recur_due_backlog",
            "Whether the last tick left due series behind (1 = yes, 0 = no)"
        )?,
    };

    SCHEDULER_METRICS
        .set(metrics)
        .map_err(|_| "Scheduler metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    SCHEDULER_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record an acknowledged document
pub fn record_document_generated() {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.documents_generated.inc();
    }
}

/// Record a cycle advanced without dispatch
pub fn record_document_reconciled() {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.documents_reconciled.inc();
    }
}

/// Record a failed generation attempt
pub fn record_generation_failure(category: &str) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.generation_failures.with_label_values(&[category]).inc();
    }
}

/// Record a series paused by the failure threshold
pub fn record_auto_pause() {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.series_auto_paused.inc();
    }
}

/// Record a completed series
pub fn record_series_completed() {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.series_completed.inc();
    }
}

/// Record acknowledged upcoming notices
pub fn record_notifications_sent(count: usize) {
    if count == 0 {
        return;
    }
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.notifications_sent.inc_by(count as f64);
    }
}

/// Update the due-series gauges after a scan
pub fn update_due_state(due: usize, has_more: bool) {
    let Some(m) = SCHEDULER_METRICS.get() else {
        return;
    };

    m.due_series.set(due as f64);
    m.backlog.set(if has_more { 1.0 } else { 0.0 });
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a tick timer (returns a timer handle)
pub fn start_tick_timer() -> MetricsTimer {
    match SCHEDULER_METRICS.get() {
        Some(m) => MetricsTimer::new(m.tick_duration.start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics() {
        // Should succeed or return Ok if already initialized
        let result = init_metrics();
        assert!(result.is_ok());

        // Second call should also be Ok (idempotent)
        let result2 = init_metrics();
        assert!(result2.is_ok());
    }

    #[test]
    fn test_metrics_initialized() {
        ensure_metrics_initialized();
        assert!(metrics_initialized());
    }

    #[test]
    fn test_encode_metrics() {
        ensure_metrics_initialized();
        record_document_generated();
        let text = encode_metrics().unwrap();
        assert!(text.contains("recur_documents_generated_total"));
    }

    #[test]
    fn test_generation_metrics() {
        ensure_metrics_initialized();
        record_document_generated();
        record_document_reconciled();
        record_generation_failure("dispatch");
        record_auto_pause();
        record_series_completed();
        record_notifications_sent(4);
        update_due_state(12, true);
        // Verify it doesn't panic
    }

    #[test]
    fn test_tick_timer() {
        ensure_metrics_initialized();
        let _timer = start_tick_timer();
        // Timer should record duration when dropped
    }

    #[test]
    fn test_noop_timer() {
        let timer = MetricsTimer::noop();
        drop(timer);
        record_notifications_sent(0);
    }
}
