//! Cron schedules for recurring workflow runs

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};

/// Errors from parsing a cron expression
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("invalid interval: {0}")]
    InvalidInterval(String),
}

/// A parsed cron schedule (UTC)
///
/// Accepts five-field expressions (`minute hour day-of-month month
/// day-of-week`) with `*`, lists, ranges and steps, the macros `@hourly`,
/// `@daily`, `@weekly`, `@monthly`, `@yearly`, and `@every <n>{ms,s,m,h}`.
///
/// ```
/// use waypoint_durable::workflow::CronSchedule;
/// use chrono::{TimeZone, Utc};
///
/// let schedule: CronSchedule = "*/15 * * * *".parse().unwrap();
/// let t = Utc.with_ymd_and_hms(2024, 1, 1, 10, 7, 0).unwrap();
/// assert_eq!(schedule.next_after(t), Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).single());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronSchedule {
    Fields(CronFields),
    Every(Duration),
}

/// Allowed values per field, as bitmasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronFields {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(interval) = s.strip_prefix("@every") {
            return parse_interval(interval.trim()).map(CronSchedule::Every);
        }
        let expr = match s {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => other,
        };

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let days_of_week = parse_field(fields[4], 0, 7, "day-of-week")?;
        // 7 is an alias for Sunday
        let days_of_week = if days_of_week & (1 << 7) != 0 {
            (days_of_week | 1) & !(1 << 7)
        } else {
            days_of_week
        };

        Ok(CronSchedule::Fields(CronFields {
            minutes: parse_field(fields[0], 0, 59, "minute")?,
            hours: parse_field(fields[1], 0, 23, "hour")?,
            days_of_month: parse_field(fields[2], 1, 31, "day-of-month")?,
            months: parse_field(fields[3], 1, 12, "month")?,
            days_of_week,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        }))
    }
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        expr.parse()
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CronSchedule::Every(interval) => {
                let step = ChronoDuration::from_std(*interval).ok()?;
                after.checked_add_signed(step)
            }
            CronSchedule::Fields(fields) => fields.next_after(after),
        }
    }
}

impl CronFields {
    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom = bit(self.days_of_month, t.day());
        let dow = bit(self.days_of_week, t.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(ChronoDuration::minutes(1))?;

        // Five years of day-level skips bounds every satisfiable expression
        for _ in 0..(366 * 5 * 24 + 60) {
            if !bit(self.months, t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(&t) {
                t = Utc
                    .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
                    .single()?
                    .checked_add_signed(ChronoDuration::days(1))?;
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t
                    .with_minute(0)?
                    .checked_add_signed(ChronoDuration::hours(1))?;
                continue;
            }
            match (t.minute()..60).find(|m| bit(self.minutes, *m)) {
                Some(minute) => return t.with_minute(minute),
                None => {
                    t = t
                        .with_minute(0)?
                        .checked_add_signed(ChronoDuration::hours(1))?;
                }
            }
        }
        None
    }
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn parse_field(field: &str, min: u32, max: u32, name: &'static str) -> Result<u64, CronError> {
    let invalid = || CronError::InvalidField {
        field: name,
        value: field.to_string(),
    };

    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<u32>().map_err(|_| invalid())?),
            None => (part, 1),
        };
        if step == 0 {
            return Err(invalid());
        }

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (
                a.parse::<u32>().map_err(|_| invalid())?,
                b.parse::<u32>().map_err(|_| invalid())?,
            )
        } else {
            let value = range.parse::<u32>().map_err(|_| invalid())?;
            // "5/10" means starting at 5, every 10
            if part.contains('/') {
                (value, max)
            } else {
                (value, value)
            }
        };

        if start < min || end > max || start > end {
            return Err(invalid());
        }
        let mut value = start;
        while value <= end {
            mask |= 1u64 << value;
            match value.checked_add(step) {
                Some(next) => value = next,
                None => break,
            }
        }
    }
    Ok(mask)
}

fn parse_interval(s: &str) -> Result<Duration, CronError> {
    let invalid = || CronError::InvalidInterval(s.to_string());
    let split = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let secs_per_unit = match unit {
        "ms" => return non_zero(Duration::from_millis(value)).ok_or_else(invalid),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return Err(invalid()),
    };
    let secs = value.checked_mul(secs_per_unit).ok_or_else(invalid)?;
    non_zero(Duration::from_secs(secs)).ok_or_else(invalid)
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}
