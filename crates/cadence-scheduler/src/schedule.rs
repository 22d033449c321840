//! Schedule parsing — cron expressions and fixed intervals.

use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;

use cadence_types::TaskType;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("invalid interval '{0}': expected '<n> second|minute|hour|day|week'")]
    InvalidInterval(String),
}

static INTERVAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(\d+)\s*(second|minute|hour|day|week)s?\s*$")
        .expect("interval pattern is valid")
});

/// A 5-field cron expression evaluated in UTC.
///
/// When both day-of-month and day-of-week are restricted, a day matches if
/// either field does. The `cron` crate requires both, so that case keeps one
/// schedule per field and fires at whichever comes first.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedules: Vec<cron::Schedule>,
}

impl CronSchedule {
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&after).next())
            .min()
    }
}

/// A parsed, validated schedule.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Calendar schedule evaluated in UTC.
    Cron(CronSchedule),
    /// Fixed period; the first fire is immediate.
    Interval(Duration),
}

impl Schedule {
    pub fn parse(expr: &str, task_type: TaskType) -> Result<Self, ScheduleError> {
        match task_type {
            TaskType::Cron => parse_cron(expr).map(Schedule::Cron),
            TaskType::Interval => parse_interval(expr).map(Schedule::Interval),
        }
    }

    /// First fire strictly after `after`.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(schedule) => schedule.next_after(after),
            Schedule::Interval(period) => {
                chrono::Duration::from_std(*period).ok().map(|p| after + p)
            }
        }
    }

    /// Next fire after falling behind: missed fires are not replayed.
    pub fn resume_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(schedule) => schedule.next_after(now),
            Schedule::Interval(_) => Some(now),
        }
    }
}

/// Parse a 5-field cron expression (minute hour day-of-month month day-of-week).
pub fn parse_cron(expr: &str) -> Result<CronSchedule, ScheduleError> {
    let invalid = |reason: String| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason,
    };

    let fields: Vec<&str> = expr.split_whitespace().collect();
    let [minute, hour, day_of_month, month, day_of_week] = fields[..] else {
        return Err(invalid(format!("expected 5 fields, got {}", fields.len())));
    };

    // The cron crate wants a leading seconds field and numbers weekdays 1-7
    // from Sunday, so the weekday field is handed over as names.
    let weekdays = if day_of_week == "*" {
        day_of_week.to_string()
    } else {
        expand_weekdays(day_of_week).map_err(&invalid)?
    };
    let build = |dom: &str, dow: &str| {
        cron::Schedule::from_str(&format!("0 {minute} {hour} {dom} {month} {dow}"))
            .map_err(|e| invalid(e.to_string()))
    };

    let schedules = if day_of_month != "*" && day_of_week != "*" {
        vec![build(day_of_month, "*")?, build("*", weekdays.as_str())?]
    } else {
        vec![build(day_of_month, weekdays.as_str())?]
    };
    Ok(CronSchedule { schedules })
}

/// Parse an interval literal such as "5 minutes" or "1 hour".
pub fn parse_interval(expr: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidInterval(expr.to_string());

    let caps = INTERVAL_RE.captures(expr).ok_or_else(invalid)?;
    let count: u64 = caps[1].parse().map_err(|_| invalid())?;
    if count == 0 {
        return Err(invalid());
    }
    let unit = match caps[2].to_ascii_lowercase().as_str() {
        "second" => 1,
        "minute" => 60,
        "hour" => 3_600,
        "day" => 86_400,
        "week" => 604_800,
        _ => return Err(invalid()),
    };
    count
        .checked_mul(unit)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Expand a day-of-week field (numbers 0-7 with 0 and 7 both Sunday, or
/// names) into an explicit list of day names.
fn expand_weekdays(field: &str) -> Result<String, String> {
    let mut days = [false; 7];
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => match step.parse::<usize>() {
                Ok(step) if step > 0 => (base, step),
                _ => return Err(format!("invalid day-of-week step '{step}'")),
            },
            None => (item, 1),
        };
        let (start, end) = match base.split_once('-') {
            _ if base == "*" => (0, 6),
            Some((start, end)) => (weekday_number(start)?, weekday_number(end)?),
            // "N/step" runs to the end of the week
            None if step > 1 => (weekday_number(base)?, 7),
            None => {
                let day = weekday_number(base)?;
                (day, day)
            }
        };
        if start > end {
            return Err(format!("day-of-week range '{base}' is reversed"));
        }
        for day in (start..=end).step_by(step) {
            days[day % 7] = true;
        }
    }

    let names: Vec<&str> = WEEKDAYS
        .iter()
        .zip(days)
        .filter_map(|(name, selected)| selected.then_some(*name))
        .collect();
    Ok(names.join(","))
}

fn weekday_number(token: &str) -> Result<usize, String> {
    if let Ok(n) = token.parse::<usize>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day-of-week {n} out of range 0-7"))
        };
    }
    WEEKDAYS
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .ok_or_else(|| format!("unknown day-of-week '{token}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn next(expr: &str, after: DateTime<Utc>) -> DateTime<Utc> {
        Schedule::parse(expr, TaskType::Cron)
            .unwrap()
            .next_fire(after)
            .unwrap()
    }

    #[test]
    fn test_interval_units() {
        assert_eq!(parse_interval("30 seconds").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("5 minutes").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_interval("1 hour").unwrap(), Duration::from_secs(3_600));
        assert_eq!(parse_interval("2 days").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_interval("1 week").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_interval(" 10 Minutes ").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_interval("15minutes").unwrap(), Duration::from_secs(900));
    }

    #[test]
    fn test_interval_rejects_garbage() {
        for bad in ["", "minutes", "5", "0 minutes", "-5 minutes", "5 fortnights", "5 minutes later", "1.5 hours"] {
            assert!(
                matches!(parse_interval(bad), Err(ScheduleError::InvalidInterval(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_interval_next_fire() {
        let schedule = Schedule::parse("5 minutes", TaskType::Interval).unwrap();
        let now = at(2024, 6, 1, 12, 0);
        assert_eq!(schedule.next_fire(now), Some(at(2024, 6, 1, 12, 5)));
        assert_eq!(schedule.resume_from(now), Some(now));
    }

    #[test]
    fn test_cron_every_quarter_hour() {
        let after = at(2024, 6, 1, 10, 7);
        assert_eq!(next("*/15 * * * *", after), at(2024, 6, 1, 10, 15));
    }

    #[test]
    fn test_cron_weekday_numbers_are_standard() {
        // 2024-06-01 is a Saturday
        let saturday = at(2024, 6, 1, 12, 0);
        assert_eq!(next("0 9 * * 1", saturday), at(2024, 6, 3, 9, 0));
        assert_eq!(next("0 0 * * 0", saturday), at(2024, 6, 2, 0, 0));
        assert_eq!(next("0 0 * * 7", saturday), at(2024, 6, 2, 0, 0));
        assert_eq!(next("0 8 * * 1-5", saturday), at(2024, 6, 3, 8, 0));
        assert_eq!(next("0 8 * * 5-7", saturday), at(2024, 6, 2, 8, 0));
        assert_eq!(next("30 6 * * MON", saturday), at(2024, 6, 3, 6, 30));
    }

    #[test]
    fn test_cron_stepped_weekday_range_keeps_sunday() {
        let saturday = at(2024, 6, 1, 12, 0);
        // Mon, Wed, Fri, Sun
        assert_eq!(next("0 0 * * 1-7/2", saturday), at(2024, 6, 2, 0, 0));
        assert_eq!(next("0 0 * * 1-7/2", at(2024, 6, 2, 12, 0)), at(2024, 6, 3, 0, 0));
        assert_eq!(next("0 0 * * 1-7/2", at(2024, 6, 3, 12, 0)), at(2024, 6, 5, 0, 0));
        // Sun, Wed, Sat
        assert_eq!(next("0 0 * * */3", at(2024, 6, 2, 12, 0)), at(2024, 6, 5, 0, 0));
        assert_eq!(next("0 0 * * 3/2", at(2024, 6, 3, 12, 0)), at(2024, 6, 5, 0, 0));
        assert_eq!(next("0 0 * * 3/2", at(2024, 6, 5, 12, 0)), at(2024, 6, 7, 0, 0));
    }

    #[test]
    fn test_cron_day_of_month_or_weekday() {
        let saturday = at(2024, 6, 1, 12, 0);
        // The 1st, or any Monday
        assert_eq!(next("0 0 1 * 1", saturday), at(2024, 6, 3, 0, 0));
        assert_eq!(next("0 0 1 * 1", at(2024, 6, 24, 12, 0)), at(2024, 7, 1, 0, 0));
        // The 15th, or any Friday
        assert_eq!(next("0 0 15 * 5", at(2024, 6, 8, 12, 0)), at(2024, 6, 14, 0, 0));
        assert_eq!(next("0 0 15 * 5", at(2024, 6, 14, 12, 0)), at(2024, 6, 15, 0, 0));
        // Only one field restricted: no widening
        assert_eq!(next("0 0 15 * *", saturday), at(2024, 6, 15, 0, 0));
    }

    #[test]
    fn test_cron_rejects_invalid() {
        for bad in [
            "not a cron",
            "* * * *",
            "* * * * * *",
            "61 * * * *",
            "0 25 * * *",
            "0 0 * * 8",
            "0 0 * * 5-2",
            "0 0 * * 1/0",
            "0 0 * * FUNDAY",
            "0 0 32 * 1",
        ] {
            assert!(
                matches!(
                    Schedule::parse(bad, TaskType::Cron),
                    Err(ScheduleError::InvalidCron { .. })
                ),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_cron_resume_skips_missed_fires() {
        let schedule = Schedule::parse("0 * * * *", TaskType::Cron).unwrap();
        let now = at(2024, 6, 1, 10, 30);
        assert_eq!(schedule.resume_from(now), Some(at(2024, 6, 1, 11, 0)));
    }
}
