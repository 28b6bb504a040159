//! Property tests for the frequency calculator

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use proptest::prelude::*;

use recur::models::{EndCondition, Frequency};
use recur::scheduler::calendar::{days_in_month, parse_timezone, to_local};
use recur::scheduler::{
    advance_to_future, next_scheduled_date, upcoming_occurrences, ScheduleParams,
};

const ZONES: [&str; 6] = [
    "UTC",
    "America/New_York",
    "Europe/Stockholm",
    "Asia/Tokyo",
    "Australia/Lord_Howe",
    "America/Sao_Paulo",
];

fn instant() -> impl Strategy<Value = DateTime<Utc>> {
    // 2000-01-01 .. 2090-01-01
    (946_684_800i64..3_786_825_600i64).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

fn zone() -> impl Strategy<Value = &'static str> {
    prop::sample::select(ZONES.to_vec())
}

fn schedulable_params() -> impl Strategy<Value = ScheduleParams> {
    let frequency = prop_oneof![
        (0u32..=6).prop_map(|d| (Frequency::Weekly, Some(d), None, None)),
        (1u32..=31).prop_map(|d| (Frequency::MonthlyDate, Some(d), None, None)),
        (0u32..=6, 1u32..=5).prop_map(|(d, w)| (Frequency::MonthlyWeekday, Some(d), Some(w), None)),
        (1u32..=31).prop_map(|d| (Frequency::Quarterly, Some(d), None, None)),
        (1u32..=31).prop_map(|d| (Frequency::SemiAnnual, Some(d), None, None)),
        (1u32..=31).prop_map(|d| (Frequency::Annual, Some(d), None, None)),
        (1u32..=90).prop_map(|i| (Frequency::Custom, None, None, Some(i))),
    ];

    (frequency, zone()).prop_map(|((frequency, day, week, interval), tz)| ScheduleParams {
        frequency,
        day,
        week,
        interval,
        timezone: parse_timezone(tz).unwrap(),
    })
}

proptest! {
    #[test]
    fn next_date_is_strictly_later(params in schedulable_params(), reference in instant()) {
        let next = next_scheduled_date(&params, reference).unwrap();
        prop_assert!(next > reference, "{:?}: {} -> {}", params, reference, next);
    }

    #[test]
    fn weekly_lands_on_weekday_within_a_week(
        day in 0u32..=6,
        tz in zone(),
        reference in instant(),
    ) {
        let params = ScheduleParams::new(Frequency::Weekly, parse_timezone(tz).unwrap()).with_day(day);
        let next = next_scheduled_date(&params, reference).unwrap();

        let local = to_local(next, params.timezone);
        prop_assert_eq!(local.weekday().num_days_from_sunday(), day);
        prop_assert!(next - reference <= Duration::days(7) + Duration::hours(2));
    }

    #[test]
    fn monthly_date_clamps_to_month_length(day in 1u32..=31, reference in instant()) {
        let params = ScheduleParams::utc(Frequency::MonthlyDate).with_day(day);
        let next = next_scheduled_date(&params, reference).unwrap();

        let expected_month = reference.month() % 12 + 1;
        prop_assert_eq!(next.month(), expected_month);
        prop_assert_eq!(next.day(), day.min(days_in_month(next.year(), next.month())));
        prop_assert_eq!(next.time(), reference.time());
    }

    #[test]
    fn custom_interval_adds_days_in_utc(interval in 1u32..=365, reference in instant()) {
        let params = ScheduleParams::utc(Frequency::Custom).with_interval(interval);
        let next = next_scheduled_date(&params, reference).unwrap();
        prop_assert_eq!(next - reference, Duration::days(i64::from(interval)));
    }

    #[test]
    fn upcoming_is_increasing_and_bounded(
        params in schedulable_params(),
        start in instant(),
        limit in 1usize..40,
    ) {
        let schedule = upcoming_occurrences(
            &params,
            &EndCondition::never(),
            start,
            0,
            10.0,
            "USD",
            limit,
        )
        .unwrap();

        prop_assert_eq!(schedule.occurrences.len(), limit);
        prop_assert_eq!(schedule.occurrences[0].date, start);
        for pair in schedule.occurrences.windows(2) {
            prop_assert!(pair[1].date > pair[0].date);
        }
    }

    #[test]
    fn after_count_lists_only_remaining(
        params in schedulable_params(),
        start in instant(),
        count in 1u32..20,
        generated in 0u32..25,
    ) {
        let schedule = upcoming_occurrences(
            &params,
            &EndCondition::after_count(count),
            start,
            generated,
            5.0,
            "EUR",
            50,
        )
        .unwrap();

        prop_assert_eq!(schedule.occurrences.len() as u32, count.saturating_sub(generated));
    }

    #[test]
    fn catch_up_lands_in_the_future(
        params in schedulable_params(),
        scheduled in instant(),
        gap_days in 0i64..400,
    ) {
        let now = scheduled + Duration::days(gap_days);
        let advance = advance_to_future(&params, scheduled, now, 1000).unwrap();

        prop_assert!(advance.next > now);
        prop_assert!(!advance.hit_safety_limit);
    }
}
