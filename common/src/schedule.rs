// Schedule parsing and next fire time calculation
//
// A bucket's ScheduleSpec uses cron-style named fields (year, month, day,
// week, day_of_week, hour, minute, second). It is converted to a seven-field
// cron expression (sec min hour dom month dow year) with these defaults:
// absent fields more significant than the least significant given field are
// `*`, absent fields below it take their minimum.

use crate::errors::ScheduleError;
use crate::models::{BucketKey, ScheduleSpec};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Field names from most to least significant, with their default when they
/// sit below the least significant given field
const FIELDS: [(&str, &str); 8] = [
    ("year", "*"),
    ("month", "1"),
    ("day", "1"),
    ("week", "*"),
    ("day_of_week", "*"),
    ("hour", "0"),
    ("minute", "0"),
    ("second", "0"),
];

const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Convert a ScheduleSpec to a cron expression
pub fn to_cron_expression(spec: &ScheduleSpec) -> Result<String, ScheduleError> {
    if let Some((unknown, _)) = spec
        .fields()
        .find(|(name, _)| !FIELDS.iter().any(|(field, _)| field == name))
    {
        return Err(ScheduleError::InvalidConfiguration(format!(
            "unknown schedule field '{}'",
            unknown
        )));
    }

    if spec.get("week").is_some() {
        return Err(ScheduleError::InvalidConfiguration(
            "ISO week numbers are not supported".to_string(),
        ));
    }

    let last_given = FIELDS
        .iter()
        .rposition(|(name, _)| spec.get(name).is_some());
    let mut resolved = std::collections::HashMap::new();
    for (index, (name, default)) in FIELDS.into_iter().enumerate() {
        let value = match spec.get(name) {
            Some(value) => value.trim().to_string(),
            None if last_given.is_some_and(|last| index > last) => default.to_string(),
            None => "*".to_string(),
        };
        resolved.insert(name, value);
    }

    let day_of_week = translate_day_of_week(&resolved["day_of_week"])?;

    Ok(format!(
        "{} {} {} {} {} {} {}",
        resolved["second"],
        resolved["minute"],
        resolved["hour"],
        resolved["day"],
        resolved["month"],
        day_of_week,
        resolved["year"]
    ))
}

/// Numeric weekdays count from Monday = 0; names pass through
fn translate_day_of_week(value: &str) -> Result<String, ScheduleError> {
    let translate_token = |token: &str| -> Result<String, ScheduleError> {
        if token.chars().all(|c| c.is_ascii_digit()) && !token.is_empty() {
            let index: usize = token.parse().map_err(|_| invalid_weekday(value))?;
            WEEKDAYS
                .get(index)
                .map(|name| name.to_string())
                .ok_or_else(|| invalid_weekday(value))
        } else {
            Ok(token.to_string())
        }
    };

    value
        .split(',')
        .map(|item| -> Result<String, ScheduleError> {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let range = match range.split_once('-') {
                Some((start, end)) => format!("{}-{}", translate_token(start)?, translate_token(end)?),
                None => translate_token(range)?,
            };
            Ok(match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            })
        })
        .collect::<Result<Vec<_>, ScheduleError>>()
        .map(|items| items.join(","))
}

fn invalid_weekday(value: &str) -> ScheduleError {
    ScheduleError::InvalidConfiguration(format!("invalid day_of_week '{}'", value))
}

/// Parse and validate a cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Resolve an optional IANA timezone name, falling back to `default`
pub fn resolve_timezone(name: Option<&str>, default: Tz) -> Result<Tz, ScheduleError> {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| ScheduleError::InvalidTimezone(name.to_string())),
        None => Ok(default),
    }
}

/// Cron rule armed for one bucket
#[derive(Debug, Clone)]
pub struct BucketTrigger {
    bucket: BucketKey,
    expression: String,
    schedule: CronSchedule,
    timezone: Tz,
    next: Option<DateTime<Utc>>,
}

impl BucketTrigger {
    /// Arm a trigger whose first fire time is strictly after `now`
    pub fn new(
        bucket: BucketKey,
        spec: &ScheduleSpec,
        timezone: Tz,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        let expression = to_cron_expression(spec)?;
        let schedule = parse_cron_expression(&expression)?;

        let mut trigger = Self {
            bucket,
            expression,
            schedule,
            timezone,
            next: None,
        };
        trigger.advance(now);
        Ok(trigger)
    }

    pub fn bucket(&self) -> &BucketKey {
        &self.bucket
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.next
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next.is_some_and(|next| next <= now)
    }

    /// Move to the first fire time after `now`; None once the rule is exhausted
    pub fn advance(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = now.with_timezone(&self.timezone);
        self.next = self
            .schedule
            .after(&local)
            .next()
            .map(|next| next.with_timezone(&Utc));
        self.next
    }

    /// Same rule, new timezone; the next fire time is recomputed from `now`
    pub fn retime(&mut self, timezone: Tz, now: DateTime<Utc>) {
        if timezone != self.timezone {
            self.timezone = timezone;
            self.advance(now);
        }
    }
}
