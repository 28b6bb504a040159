//! Local civil time <-> UTC instant boundary
//!
//! Every interval calculation runs on a [`NaiveDateTime`] in the series'
//! timezone. Only the helpers in this module move between that civil time
//! and an absolute [`DateTime<Utc>`], so the rest of the calculator never
//! has to think about offsets or DST.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc,
    Weekday,
};
use chrono_tz::Tz;

use super::error::{SchedulerError, SchedulerResult};

/// Longest DST gap we walk across when a local time does not exist
const MAX_GAP_MINUTES: i64 = 180;

/// Parse an IANA timezone name
pub fn parse_timezone(name: &str) -> SchedulerResult<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::invalid_timezone(name))
}

/// Civil date-time of `instant` as seen in `tz`
pub fn to_local(instant: DateTime<Utc>, tz: Tz) -> NaiveDateTime {
    instant.with_timezone(&tz).naive_local()
}

/// Resolve a civil date-time in `tz` to an absolute instant
///
/// Ambiguous times (clocks falling back) resolve to the earlier instant.
/// Times inside a gap (clocks springing forward) are pushed forward by the
/// gap length, so 02:30 on a spring-forward night becomes 03:30.
pub fn to_instant(local: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => resolve_gap(local, tz),
    }
}

fn resolve_gap(local: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    // Offset in force just before the gap, applied to the missing wall time
    let mut earlier = local;
    for _ in 0..(MAX_GAP_MINUTES / 15) {
        earlier -= Duration::minutes(15);
        if let Some(before) = tz.from_local_datetime(&earlier).earliest() {
            let offset = before.offset().fix();
            let shifted = offset.from_local_datetime(&local).earliest();
            if let Some(dt) = shifted {
                return dt.with_timezone(&Utc);
            }
        }
    }

    tracing::warn!(%local, tz = %tz, "Unresolvable local time, interpreting as UTC");
    Utc.from_utc_datetime(&local)
}

/// Number of days in a month
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first_of_next| first_of_next.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// Move `date` forward by `months` and pin the day-of-month to `day`,
/// clamped to the target month's length
pub fn add_months_clamped(date: NaiveDate, months: u32, day: u32) -> SchedulerResult<NaiveDate> {
    let zero_based = date.month0() + months;
    let year = date.year() + (zero_based / 12) as i32;
    let month = zero_based % 12 + 1;
    let day = day.clamp(1, days_in_month(year, month));

    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| {
        SchedulerError::date_out_of_range(format!("{year}-{month:02}-{day:02}"))
    })
}

/// Nth occurrence of `weekday` in a month, counting from the first occurrence
///
/// `week` is not bounded by the month: a fifth occurrence that does not
/// exist spills into the following month.
pub fn nth_weekday_of_month(
    year: i32,
    month: u32,
    weekday: Weekday,
    week: u32,
) -> SchedulerResult<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| {
        SchedulerError::date_out_of_range(format!("{year}-{month:02}"))
    })?;

    let current = first.weekday().num_days_from_sunday();
    let target = weekday.num_days_from_sunday();
    let until_target = (target + 7 - current) % 7;
    let offset = until_target + week.saturating_sub(1) * 7;

    Ok(first + Duration::days(i64::from(offset)))
}

/// Weekday for a Sunday-based index (0 = Sunday ... 6 = Saturday)
pub fn weekday_from_sunday(index: u32) -> Weekday {
    match index {
        0 => Weekday::Sun,
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        _ => Weekday::Sat,
    }
}

/// Add calendar months to a UTC instant (day clamped to the month's length)
pub fn add_months_utc(instant: DateTime<Utc>, months: u32) -> SchedulerResult<DateTime<Utc>> {
    let naive = instant.naive_utc();
    let date = add_months_clamped(naive.date(), months, naive.day())?;
    Ok(Utc.from_utc_datetime(&date.and_time(naive.time())))
}
