// Property-based tests for schedule conversion and bucket triggers

use chrono::{Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use common::models::{BucketKey, ScheduleSpec};
use common::schedule::{parse_cron_expression, to_cron_expression, BucketTrigger};
use proptest::prelude::*;

/// Any in-range hour/minute/second spec converts to a parseable expression
#[test]
fn property_time_specs_convert_to_valid_cron() {
    proptest!(|(
        hour in prop::option::of(0u32..24),
        minute in prop::option::of(0u32..60),
        second in prop::option::of(0u32..60)
    )| {
        let mut spec = ScheduleSpec::new();
        if let Some(h) = hour {
            spec = spec.with("hour", h.to_string());
        }
        if let Some(m) = minute {
            spec = spec.with("minute", m.to_string());
        }
        if let Some(s) = second {
            spec = spec.with("second", s.to_string());
        }

        let expression = to_cron_expression(&spec).unwrap();
        prop_assert_eq!(expression.split(' ').count(), 7);
        prop_assert!(parse_cron_expression(&expression).is_ok());
    });
}

/// An hour-only bucket fires strictly later, at minute and second zero of that hour
#[test]
fn property_hour_trigger_fires_on_the_hour() {
    proptest!(|(hour in 0u32..24, offset_minutes in 0i64..(60 * 24 * 30))| {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(offset_minutes);
        let spec = ScheduleSpec::new().with("hour", hour.to_string());
        let trigger = BucketTrigger::new(BucketKey::from_spec(&spec), &spec, Tz::UTC, now).unwrap();

        let next = trigger.next_fire().unwrap();
        prop_assert!(next > now);
        prop_assert!(next - now <= Duration::days(1));
        prop_assert_eq!(next.hour(), hour);
        prop_assert_eq!(next.minute(), 0);
        prop_assert_eq!(next.second(), 0);
    });
}
