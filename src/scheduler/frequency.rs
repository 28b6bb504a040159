//! Frequency date calculator
//!
//! Pure functions that decide when a series fires next, preview upcoming
//! occurrences and evaluate end conditions. Nothing here reads the clock;
//! every "now" is a parameter.
//!
//! All interval math happens on the series' local civil date-time (see
//! [`super::calendar`]). The time-of-day of the reference is preserved and
//! converted back to an instant only at the end, so a DST transition in the
//! series' timezone never moves the intended calendar date.

use chrono::{DateTime, Datelike, Days, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::calendar::{
    add_months_clamped, nth_weekday_of_month, to_instant, to_local, weekday_from_sunday,
};
use super::error::{SchedulerError, SchedulerResult};
use crate::models::{EndCondition, EndType, Frequency};

/// Iteration cap for previews of bounded series
pub const MAX_BOUNDED_PREVIEW: usize = 100;

/// Iteration cap when counting occurrences up to an end date
pub const MAX_SUMMARY_ENUMERATION: u32 = 1000;

/// Default cap for the catch-up loop
pub const DEFAULT_CATCH_UP_ITERATIONS: u32 = 1000;

// ============================================================================
// Parameters
// ============================================================================

/// Inputs of the date calculator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleParams {
    pub frequency: Frequency,
    /// Weekday (0 = Sunday) or day-of-month, depending on frequency
    pub day: Option<u32>,
    /// Week of month (1-5) for monthly_weekday
    pub week: Option<u32>,
    /// Days between occurrences for custom
    pub interval: Option<u32>,
    pub timezone: Tz,
}

impl ScheduleParams {
    /// Parameters with no day/week/interval set
    pub fn new(frequency: Frequency, timezone: Tz) -> Self {
        Self {
            frequency,
            day: None,
            week: None,
            interval: None,
            timezone,
        }
    }

    /// Parameters in UTC
    pub fn utc(frequency: Frequency) -> Self {
        Self::new(frequency, Tz::UTC)
    }

    /// Set day parameter
    pub fn with_day(mut self, day: u32) -> Self {
        self.day = Some(day);
        self
    }

    /// Set week parameter
    pub fn with_week(mut self, week: u32) -> Self {
        self.week = Some(week);
        self
    }

    /// Set interval parameter
    pub fn with_interval(mut self, interval: u32) -> Self {
        self.interval = Some(interval);
        self
    }
}

/// Check frequency parameters before a series is persisted
pub fn validate_frequency_params(
    frequency: Frequency,
    day: Option<u32>,
    week: Option<u32>,
    interval: Option<u32>,
) -> SchedulerResult<()> {
    let require_weekday = |day: Option<u32>| match day {
        Some(d) if d <= 6 => Ok(()),
        Some(d) => Err(SchedulerError::validation(
            "frequency_day",
            format!("weekday must be 0-6, got {d}"),
        )),
        None => Err(SchedulerError::validation(
            "frequency_day",
            format!("required for {frequency} frequency"),
        )),
    };

    let require_month_day = |day: Option<u32>| match day {
        Some(d) if (1..=31).contains(&d) => Ok(()),
        Some(d) => Err(SchedulerError::validation(
            "frequency_day",
            format!("day of month must be 1-31, got {d}"),
        )),
        None => Err(SchedulerError::validation(
            "frequency_day",
            format!("required for {frequency} frequency"),
        )),
    };

    match frequency {
        Frequency::Weekly | Frequency::Biweekly => require_weekday(day),
        Frequency::MonthlyDate | Frequency::Quarterly | Frequency::SemiAnnual | Frequency::Annual => {
            require_month_day(day)
        }
        Frequency::MonthlyWeekday => {
            require_weekday(day)?;
            match week {
                Some(w) if (1..=5).contains(&w) => Ok(()),
                Some(w) => Err(SchedulerError::validation(
                    "frequency_week",
                    format!("week of month must be 1-5, got {w}"),
                )),
                None => Err(SchedulerError::validation(
                    "frequency_week",
                    "required for monthly_weekday frequency",
                )),
            }
        }
        Frequency::MonthlyLastDay => Ok(()),
        Frequency::Custom => match interval {
            Some(i) if i >= 1 => Ok(()),
            _ => Err(SchedulerError::validation(
                "frequency_interval",
                "must be at least 1 day for custom frequency",
            )),
        },
    }
}

// ============================================================================
// Next Date
// ============================================================================

/// Next occurrence strictly after `reference`
///
/// `biweekly` and `monthly_last_day` have no calculation rule and return
/// [`SchedulerError::UnsupportedFrequency`].
pub fn next_scheduled_date(
    params: &ScheduleParams,
    reference: DateTime<Utc>,
) -> SchedulerResult<DateTime<Utc>> {
    let local = to_local(reference, params.timezone);
    let date = local.date();

    let next_date = match params.frequency {
        Frequency::Weekly => {
            let target = params.day.unwrap_or(0).min(6);
            let current = date.weekday().num_days_from_sunday();
            let ahead = match (target + 7 - current) % 7 {
                0 => 7,
                n => n,
            };
            date + Days::new(u64::from(ahead))
        }
        Frequency::MonthlyDate => add_months_clamped(date, 1, params.day.unwrap_or(1))?,
        Frequency::MonthlyWeekday => {
            let weekday = weekday_from_sunday(params.day.unwrap_or(0).min(6));
            let week = params.week.unwrap_or(1).clamp(1, 5);
            let next_month = add_months_clamped(date, 1, 1)?;
            nth_weekday_of_month(next_month.year(), next_month.month(), weekday, week)?
        }
        Frequency::Quarterly => add_months_clamped(date, 3, params.day.unwrap_or(date.day()))?,
        Frequency::SemiAnnual => add_months_clamped(date, 6, params.day.unwrap_or(date.day()))?,
        Frequency::Annual => add_months_clamped(date, 12, params.day.unwrap_or(date.day()))?,
        Frequency::Custom => {
            let interval = params.interval.unwrap_or(1).max(1);
            date.checked_add_days(Days::new(u64::from(interval)))
                .ok_or_else(|| SchedulerError::date_out_of_range(format!("{date} + {interval} days")))?
        }
        Frequency::Biweekly | Frequency::MonthlyLastDay => {
            return Err(SchedulerError::unsupported_frequency(params.frequency.as_str()));
        }
    };

    Ok(to_instant(next_date.and_time(local.time()), params.timezone))
}

/// When the first document of a new series is due
///
/// A future issue date (compared at UTC day level) is kept; anything today
/// or earlier fires immediately.
pub fn first_scheduled_date(issue_date: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if issue_date.date_naive() > now.date_naive() {
        issue_date
    } else {
        now
    }
}

// ============================================================================
// End Conditions
// ============================================================================

/// Whether a series has reached its end condition
pub fn is_completed(
    end: &EndCondition,
    generated: u32,
    next_scheduled_at: Option<DateTime<Utc>>,
) -> bool {
    match end.end_type {
        EndType::Never => false,
        EndType::OnDate => match (end.end_date, next_scheduled_at) {
            (Some(end_date), Some(next)) => next > end_date,
            _ => false,
        },
        EndType::AfterCount => end.end_count.is_some_and(|count| generated >= count),
    }
}

// ============================================================================
// Catch-up
// ============================================================================

/// Result of advancing a schedule past `now`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    pub next: DateTime<Utc>,
    /// Cycles skipped to reach the future
    pub skipped: u32,
    /// True when the loop gave up and rescheduled from `now`
    pub hit_safety_limit: bool,
}

/// Reapply the calculator until the date is strictly after `now`
///
/// Missed cycles are skipped rather than generated. After `max_iterations`
/// steps the loop gives up and schedules from `now` instead.
pub fn advance_to_future(
    params: &ScheduleParams,
    scheduled: DateTime<Utc>,
    now: DateTime<Utc>,
    max_iterations: u32,
) -> SchedulerResult<Advance> {
    let mut next = scheduled;
    let mut skipped = 0;

    while next <= now {
        if skipped >= max_iterations {
            return Ok(Advance {
                next: next_scheduled_date(params, now)?,
                skipped: 0,
                hit_safety_limit: true,
            });
        }
        next = next_scheduled_date(params, next)?;
        skipped += 1;
    }

    Ok(Advance {
        next,
        skipped,
        hit_safety_limit: false,
    })
}

// ============================================================================
// Upcoming Occurrences
// ============================================================================

/// A projected occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occurrence {
    pub date: DateTime<Utc>,
    pub amount: f64,
}

/// Totals over the whole (remaining) series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpcomingSummary {
    pub has_end_date: bool,
    pub total_count: Option<u32>,
    pub total_amount: Option<f64>,
    pub currency: String,
}

/// Preview of upcoming occurrences plus totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpcomingSchedule {
    pub occurrences: Vec<Occurrence>,
    pub summary: UpcomingSummary,
}

/// Project the next occurrences of a series starting at `start`
///
/// Stops at `limit`, at the end date (an occurrence after it is excluded) or
/// once `end_count - already_generated` occurrences are listed. Bounded
/// series are additionally capped at [`MAX_BOUNDED_PREVIEW`].
pub fn upcoming_occurrences(
    params: &ScheduleParams,
    end: &EndCondition,
    start: DateTime<Utc>,
    already_generated: u32,
    amount: f64,
    currency: &str,
    limit: usize,
) -> SchedulerResult<UpcomingSchedule> {
    let max_iterations = match end.end_type {
        EndType::Never => limit,
        _ => limit.min(MAX_BOUNDED_PREVIEW),
    };

    let remaining = match (end.end_type, end.end_count) {
        (EndType::AfterCount, Some(count)) => Some(count.saturating_sub(already_generated) as usize),
        _ => None,
    };

    let mut occurrences = Vec::with_capacity(max_iterations.min(64));
    let mut current = start;

    while occurrences.len() < max_iterations {
        if end.end_type == EndType::OnDate && end.end_date.is_some_and(|d| current > d) {
            break;
        }
        if remaining.is_some_and(|r| occurrences.len() >= r) {
            break;
        }

        occurrences.push(Occurrence {
            date: current,
            amount,
        });
        current = next_scheduled_date(params, current)?;
    }

    let (total_count, total_amount) = match (end.end_type, end.end_count, end.end_date) {
        (EndType::AfterCount, Some(count), _) => (Some(count), Some(f64::from(count) * amount)),
        (EndType::OnDate, _, Some(end_date)) => {
            let count = count_until(params, start, end_date)?;
            (Some(count), Some(f64::from(count) * amount))
        }
        _ => (None, None),
    };

    Ok(UpcomingSchedule {
        occurrences,
        summary: UpcomingSummary {
            has_end_date: end.end_type != EndType::Never,
            total_count,
            total_amount,
            currency: currency.to_string(),
        },
    })
}

fn count_until(
    params: &ScheduleParams,
    start: DateTime<Utc>,
    end_date: DateTime<Utc>,
) -> SchedulerResult<u32> {
    let mut current = start;
    let mut count = 0;

    while current <= end_date && count < MAX_SUMMARY_ENUMERATION {
        count += 1;
        current = next_scheduled_date(params, current)?;
    }

    Ok(count)
}
