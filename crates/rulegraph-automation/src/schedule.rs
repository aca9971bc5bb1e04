//! Cron-like schedules
//!
//! Five fields, `minute hour day-of-month month day-of-week`, each `*`, a
//! number, a range `a-b`, a step `*/n` or `a-b/n`, or a comma list of those.
//! Months and weekdays also accept three-letter names; weekday 0 and 7 are
//! both Sunday. When both day fields are restricted a day matches if either
//! does. The `@hourly`, `@daily`/`@midnight`, `@weekly`, `@monthly` and
//! `@yearly`/`@annually` shorthands are accepted.
//!
//! Schedules are evaluated in a fixed UTC offset.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("invalid time zone '{0}', expected a UTC offset such as +02:00")]
    InvalidTimeZone(String),
}

pub type TriggerResult<T> = Result<T, TriggerError>;

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Search horizon for the next fire time
const MAX_SEARCH_DAYS: i64 = 366 * 5;

/// Parse a fixed UTC offset: `Z`, `UTC`, `+02:00`, `-0530`, `+01`
pub fn parse_offset(s: &str) -> TriggerResult<FixedOffset> {
    let trimmed = s.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| TriggerError::InvalidTimeZone(s.into()));
    }

    let invalid = || TriggerError::InvalidTimeZone(s.to_string());
    let (sign, rest) = match trimmed.as_bytes().first() {
        Some(b'+') => (1, &trimmed[1..]),
        Some(b'-') => (-1, &trimmed[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().map_err(|_| invalid())?, 0),
        4 => (
            digits[..2].parse::<i32>().map_err(|_| invalid())?,
            digits[2..].parse::<i32>().map_err(|_| invalid())?,
        ),
        _ => return Err(invalid()),
    };
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// Allowed values of one field as a bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    restricted: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }
}

/// A parsed schedule bound to a UTC offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    offset: FixedOffset,
}

impl CronSchedule {
    pub fn parse(expression: &str, offset: FixedOffset) -> TriggerResult<Self> {
        let expanded = match expression.trim() {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(TriggerError::InvalidCron {
                expression: expression.to_string(),
                message: format!("expected 5 fields, found {}", fields.len()),
            });
        }

        let field = |raw: &str, min: u32, max: u32, names: &[&str], name_base: u32| {
            parse_field(raw, min, max, names, name_base).map_err(|message| {
                TriggerError::InvalidCron {
                    expression: expression.to_string(),
                    message,
                }
            })
        };

        let mut days_of_week = field(fields[4], 0, 7, &WEEKDAYS, 0)?;
        // 7 is an alias for Sunday
        if days_of_week.contains(7) {
            days_of_week.bits |= 1;
        }

        Ok(Self {
            expression: expression.to_string(),
            minutes: field(fields[0], 0, 59, &[], 0)?,
            hours: field(fields[1], 0, 23, &[], 0)?,
            days_of_month: field(fields[2], 1, 31, &[], 0)?,
            months: field(fields[3], 1, 12, &MONTHS, 1)?,
            days_of_week,
            offset,
        })
    }

    /// Parse with an optional per-trigger zone, falling back to `default_offset`
    pub fn with_zone(
        expression: &str,
        time_zone: Option<&str>,
        default_offset: FixedOffset,
    ) -> TriggerResult<Self> {
        let offset = match time_zone {
            Some(zone) => parse_offset(zone)?,
            None => default_offset,
        };
        Self::parse(expression, offset)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        if self.days_of_month.restricted && self.days_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Whether the minute containing `time` is a fire time
    pub fn matches(&self, time: DateTime<Utc>) -> bool {
        let local = time.with_timezone(&self.offset).naive_local();
        self.months.contains(local.month())
            && self.day_matches(local.date())
            && self.hours.contains(local.hour())
            && self.minutes.contains(local.minute())
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.offset).naive_local();
        let start = local.date().and_time(NaiveTime::from_hms_opt(local.hour(), local.minute(), 0)?)
            + Duration::minutes(1);
        let limit = start + Duration::days(MAX_SEARCH_DAYS);

        let mut candidate = start;
        while candidate < limit {
            if !self.months.contains(candidate.month()) {
                candidate = first_of_next_month(candidate.date())?;
                continue;
            }
            if !self.day_matches(candidate.date()) {
                candidate = candidate.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(candidate.hour()) {
                candidate = candidate.date().and_hms_opt(candidate.hour(), 0, 0)?
                    + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(to_utc(candidate, self.offset));
        }
        None
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn to_utc(local: NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    (local - Duration::seconds(i64::from(offset.local_minus_utc()))).and_utc()
}

fn parse_field(
    raw: &str,
    min: u32,
    max: u32,
    names: &[&str],
    name_base: u32,
) -> Result<FieldSet, String> {
    let mut set = FieldSet {
        bits: 0,
        restricted: !raw.starts_with('*'),
    };

    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}'", step))?;
                if step == 0 {
                    return Err("step must be positive".into());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (
                parse_value(a, names, name_base)?,
                parse_value(b, names, name_base)?,
            )
        } else {
            let value = parse_value(range, names, name_base)?;
            // `5/15` means 5, 20, 35, 50
            (value, if step > 1 { max } else { value })
        };

        if start < min || end > max || start > end {
            return Err(format!("'{}' is outside {}-{}", part, min, max));
        }

        let mut value = start;
        while value <= end {
            set.bits |= 1u64 << value;
            value += step;
        }
    }

    Ok(set)
}

fn parse_value(raw: &str, names: &[&str], name_base: u32) -> Result<u32, String> {
    if let Ok(value) = raw.parse::<u32>() {
        return Ok(value);
    }
    let lower = raw.to_ascii_lowercase();
    names
        .iter()
        .position(|name| *name == lower)
        .map(|i| i as u32 + name_base)
        .ok_or_else(|| format!("invalid value '{}'", raw))
}
