use std::str::FromStr;
use std::sync::Arc;

use cadence_core::Clock;
use chrono::{DateTime, Duration, Months, Utc};
use cron::Schedule;

use crate::error::{Result, SchedulerError};
use crate::types::{RecurrenceType, ScheduleRecurrence};

/// Parse a standard 5-field cron expression (`min hour day-of-month month day-of-week`).
///
/// The `cron` crate wants a leading seconds field, so the expression is pinned to
/// second zero before parsing. Its day-of-week numbering also differs from standard
/// cron, so that field is rewritten first. Anything other
/// than five fields is rejected.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    let [minute, hour, day_of_month, month, day_of_week] = fields[..] else {
        return Err(SchedulerError::InvalidRecurrence(format!(
            "cron expression {trimmed:?} has {} fields; expected 5 \
             (minute hour day-of-month month day-of-week)",
            fields.len()
        )));
    };
    let day_of_week = day_of_week_field(day_of_week)?;
    Schedule::from_str(&format!(
        "0 {minute} {hour} {day_of_month} {month} {day_of_week}"
    ))
    .map_err(|e| SchedulerError::InvalidRecurrence(format!("cron expression {trimmed:?}: {e}")))
}

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite a standard day-of-week field (0-6 = Sun-Sat, 7 = Sun again) in the `cron`
/// crate's numbering (1-7 = Sun-Sat).
///
/// Every list item (`d`, `a-b`, `*/n`, `a-b/n`, `a/n`, three-letter names) is expanded
/// to the days it selects and the result is written back as an explicit list.
fn day_of_week_field(field: &str) -> Result<String> {
    if field == "*" {
        return Ok(field.to_string());
    }

    let mut selected = [false; 7];
    for item in field.split(',') {
        let invalid = || {
            SchedulerError::InvalidRecurrence(format!(
                "invalid day-of-week {item:?} in {field:?}; expected 0-7 or SUN-SAT"
            ))
        };
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step = step.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(invalid)?;
                (range, step)
            }
            None => (item, 1),
        };
        let (first, last) = match (range, range.split_once('-')) {
            ("*", _) => (0, 6),
            (_, Some((from, to))) => (weekday(from).ok_or_else(invalid)?, weekday(to).ok_or_else(invalid)?),
            (single, None) => {
                let day = weekday(single).ok_or_else(invalid)?;
                // `a/n` runs from `a` to the end of the week.
                (day, if step > 1 { day.max(6) } else { day })
            }
        };
        if first > last {
            return Err(invalid());
        }
        for day in (first..=last).step_by(step) {
            selected[day % 7] = true;
        }
    }

    let days: Vec<String> = selected
        .iter()
        .enumerate()
        .filter(|(_, on)| **on)
        .map(|(day, _)| (day + 1).to_string())
        .collect();
    Ok(days.join(","))
}

/// `0`-`7` (both ends Sunday) or a three-letter English name.
fn weekday(value: &str) -> Option<usize> {
    if let Ok(n) = value.parse::<usize>() {
        return (n <= 7).then_some(n);
    }
    WEEKDAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(value))
}

/// Computes when a recurring job should run next.
///
/// Pure apart from the injected clock, which is read only to decide whether the
/// recurrence has ended.
#[derive(Clone)]
pub struct RecurrenceEngine {
    clock: Arc<dyn Clock>,
}

impl RecurrenceEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Next run strictly after `current_run_at`, or `None` once the recurrence has ended.
    ///
    /// `occurrence_count` is the number of runs completed so far. Month and year steps
    /// clamp to the last valid day of the target month (Jan 31 + 1 month is Feb 29 in a
    /// leap year), and each step starts from `current_run_at`, so a clamped day is not
    /// restored on later steps.
    pub fn calculate_next_run_time(
        &self,
        current_run_at: DateTime<Utc>,
        recurrence: &ScheduleRecurrence,
        occurrence_count: u32,
    ) -> Result<Option<DateTime<Utc>>> {
        if !recurrence.is_repeating() {
            return Err(SchedulerError::InvalidArgument(
                "one-time recurrence has no next run".to_string(),
            ));
        }
        if recurrence.has_ended(self.clock.now(), occurrence_count) {
            return Ok(None);
        }

        let interval = recurrence.interval;
        if recurrence.kind.is_fixed_interval() && interval == 0 {
            return Err(SchedulerError::InvalidArgument(format!(
                "{:?} recurrence interval must be at least 1",
                recurrence.kind
            )));
        }

        let next = match recurrence.kind {
            RecurrenceType::Cron => {
                let expr = recurrence.cron_expression.as_deref().ok_or_else(|| {
                    SchedulerError::InvalidRecurrence(
                        "cron recurrence requires an expression".to_string(),
                    )
                })?;
                let schedule = parse_cron(expr)?;
                let next = schedule.after(&current_run_at).next();
                if next.is_none() {
                    // An expression like "0 0 30 2 *" never fires.
                    return Err(SchedulerError::InvalidRecurrence(format!(
                        "cron expression {expr:?} has no run after {current_run_at}"
                    )));
                }
                next
            }
            RecurrenceType::Minute => {
                current_run_at.checked_add_signed(Duration::minutes(i64::from(interval)))
            }
            RecurrenceType::Hour => {
                current_run_at.checked_add_signed(Duration::hours(i64::from(interval)))
            }
            RecurrenceType::Day => {
                current_run_at.checked_add_signed(Duration::days(i64::from(interval)))
            }
            RecurrenceType::Week => {
                current_run_at.checked_add_signed(Duration::weeks(i64::from(interval)))
            }
            RecurrenceType::Month => current_run_at.checked_add_months(Months::new(interval)),
            RecurrenceType::Year => interval
                .checked_mul(12)
                .and_then(|months| current_run_at.checked_add_months(Months::new(months))),
            RecurrenceType::OneTime => {
                return Err(SchedulerError::InvalidArgument(
                    "one-time recurrence has no next run".to_string(),
                ))
            }
        };

        next.map(Some).ok_or_else(|| {
            SchedulerError::InvalidRecurrence(format!(
                "next run after {current_run_at} is out of range"
            ))
        })
    }

    /// Human-readable description of the next run, for diagnostics only.
    pub fn describe_next_run(
        &self,
        current_run_at: DateTime<Utc>,
        recurrence: &ScheduleRecurrence,
        occurrence_count: u32,
    ) -> Result<String> {
        if !recurrence.is_repeating() {
            return Ok("does not repeat".to_string());
        }
        Ok(
            match self.calculate_next_run_time(current_run_at, recurrence, occurrence_count)? {
                Some(next) => describe_relative(next, self.clock.now()),
                None => "recurrence has ended".to_string(),
            },
        )
    }
}

/// Render `at` relative to `now`, e.g. "in 5 minutes" or "overdue by 2 hours".
pub fn describe_relative(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = at - now;
    let secs = delta.num_seconds().abs();
    if secs < 60 {
        return "now".to_string();
    }
    let span = if secs < 3_600 {
        plural(secs / 60, "minute")
    } else if secs < 86_400 {
        plural(secs / 3_600, "hour")
    } else {
        plural(secs / 86_400, "day")
    };
    if delta > Duration::zero() {
        format!("in {span}")
    } else {
        format!("overdue by {span}")
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {unit}")
    } else {
        format!("{n} {unit}s")
    }
}
