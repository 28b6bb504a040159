//! Forecast projector
//!
//! Projects every active series across a horizon of calendar months and
//! sums the expected amounts per UTC month. Each series is enumerated with a
//! frequency-specific occurrence bound so the projection never walks an
//! unbounded schedule.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use super::calendar::add_months_utc;
use super::error::{SchedulerError, SchedulerResult};
use super::frequency::{
    advance_to_future, next_scheduled_date, upcoming_occurrences, DEFAULT_CATCH_UP_ITERATIONS,
};
use super::lifecycle::DEFAULT_CURRENCY;
use crate::models::{Frequency, RecurringSeries, SeriesStatus};

/// Extra occurrences enumerated beyond the estimate
const OCCURRENCE_BUFFER: usize = 2;

/// Average weeks per month
const WEEKS_PER_MONTH: f64 = 4.33;

/// Projected totals for one calendar month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthForecast {
    /// `YYYY-MM`
    pub month: String,
    pub total: f64,
    pub count: u32,
    pub by_currency: BTreeMap<String, f64>,
}

impl MonthForecast {
    fn empty(month: String) -> Self {
        Self {
            month,
            total: 0.0,
            count: 0,
            by_currency: BTreeMap::new(),
        }
    }
}

/// Projection over the whole horizon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub generated_at: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub months: Vec<MonthForecast>,
    pub series_projected: usize,
    pub series_skipped: usize,
}

impl Forecast {
    /// Total over all months
    pub fn total(&self) -> f64 {
        self.months.iter().map(|m| m.total).sum()
    }

    /// Format as display string
    pub fn display(&self) -> String {
        let mut output = String::from("Forecast\n");
        output.push_str(&format!("{:-<40}\n", ""));
        for month in &self.months {
            output.push_str(&format!(
                "{}  {:>4} docs  {:>12.2}\n",
                month.month, month.count, month.total
            ));
            for (currency, amount) in &month.by_currency {
                output.push_str(&format!("           {currency:<5} {amount:>12.2}\n"));
            }
        }
        output.push_str(&format!("{:-<40}\n", ""));
        output.push_str(&format!("Total: {:.2}\n", self.total()));
        output.push_str(&format!(
            "Series: {} projected, {} skipped\n",
            self.series_projected, self.series_skipped
        ));
        output
    }
}

fn month_key(instant: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", instant.year(), instant.month())
}

fn add_to_bucket(
    buckets: &mut BTreeMap<String, MonthForecast>,
    key: &str,
    amount: f64,
    currency: &str,
) {
    // Only months inside the horizon are reported
    let Some(bucket) = buckets.get_mut(key) else {
        return;
    };
    bucket.total += amount;
    bucket.count += 1;
    *bucket.by_currency.entry(currency.to_string()).or_insert(0.0) += amount;
}

/// Upper bound of occurrences of one series in `months` months
pub fn max_occurrences(frequency: Frequency, interval: Option<u32>, months: u32) -> usize {
    let m = f64::from(months);
    let estimate = match frequency {
        Frequency::Weekly | Frequency::Biweekly => (WEEKS_PER_MONTH * m).ceil(),
        Frequency::Custom => {
            let interval = f64::from(interval.unwrap_or(1).max(1));
            (31.0 * m / interval).ceil()
        }
        Frequency::MonthlyDate | Frequency::MonthlyWeekday | Frequency::MonthlyLastDay => m,
        Frequency::Quarterly => (m / 3.0).ceil(),
        Frequency::SemiAnnual => (m / 6.0).ceil(),
        Frequency::Annual => (m / 12.0).ceil(),
    };
    estimate as usize + OCCURRENCE_BUFFER
}

/// Project active series `months` calendar months ahead of `now`
///
/// Every month from `now`'s month through the window end is listed, even
/// when empty, and no other month is. Series whose frequency has no
/// calculation rule are skipped.
///
/// A series whose `next_scheduled_at` is already past is counted once in
/// the current month, since catch-up generates a single document for the
/// missed cycles. Its remaining occurrences are projected from the first
/// date after `now`.
pub fn project_forecast(
    series: &[RecurringSeries],
    now: DateTime<Utc>,
    months: u32,
) -> SchedulerResult<Forecast> {
    if months == 0 {
        return Err(SchedulerError::validation("months", "must be at least 1"));
    }

    let window_end = add_months_utc(now, months)?;

    let mut buckets: BTreeMap<String, MonthForecast> = BTreeMap::new();
    let mut cursor = now;
    while month_key(cursor) <= month_key(window_end) {
        let key = month_key(cursor);
        buckets.insert(key.clone(), MonthForecast::empty(key));
        cursor = add_months_utc(cursor, 1)?;
    }

    let mut projected = 0;
    let mut skipped = 0;

    for s in series.iter().filter(|s| s.status == SeriesStatus::Active) {
        let Some(start) = s.next_scheduled_at else {
            continue;
        };
        if !s.frequency.is_schedulable() {
            tracing::warn!(
                series_id = %s.id,
                frequency = %s.frequency,
                "Skipping series without a date rule in forecast"
            );
            skipped += 1;
            continue;
        }

        let params = s.schedule_params()?;
        let amount = s.amount.unwrap_or(0.0);
        let currency = s.currency.as_deref().unwrap_or(DEFAULT_CURRENCY);
        let end = s.end_condition();
        let limit = max_occurrences(s.frequency, s.frequency_interval, months);

        let mut generated = s.invoices_generated;
        let mut from = start;
        if start < now {
            let overdue =
                upcoming_occurrences(&params, &end, start, generated, amount, currency, 1)?;
            if let Some(occurrence) = overdue.occurrences.first() {
                add_to_bucket(&mut buckets, &month_key(now), occurrence.amount, currency);
                generated += 1;
            }
            let candidate = next_scheduled_date(&params, start)?;
            from = advance_to_future(&params, candidate, now, DEFAULT_CATCH_UP_ITERATIONS)?.next;
        }

        let schedule =
            upcoming_occurrences(&params, &end, from, generated, amount, currency, limit)?;

        for occurrence in schedule.occurrences.iter().filter(|o| o.date <= window_end) {
            add_to_bucket(&mut buckets, &month_key(occurrence.date), occurrence.amount, currency);
        }
        projected += 1;
    }

    Ok(Forecast {
        generated_at: now,
        window_end,
        months: buckets.into_values().collect(),
        series_projected: projected,
        series_skipped: skipped,
    })
}
