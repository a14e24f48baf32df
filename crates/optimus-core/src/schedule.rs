//! Run-slot enumeration and the clock abstraction.
//!
//! All cron arithmetic happens in UTC on instants, never on rendered
//! strings. Enumeration is deterministic: the same schedule and range always
//! produce the same instants.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};

use crate::models::JobSchedule;

/// Wall clock, injectable so tests stay deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System UTC clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a fixed instant.
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("malformed cron expression '{expression}': {reason}")]
    MalformedCron { expression: String, reason: String },
}

/// Every scheduled instant `t` of `schedule` with
/// `range_start <= t <= range_end`, additionally clamped by the job's own
/// start and end dates. Bounds are inclusive.
pub fn enumerate_runs(
    schedule: &JobSchedule,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
    let cron = parse_cron(&schedule.interval)?;

    let lower = range_start.max(schedule.start_date);
    let upper = match schedule.end_date {
        Some(end) => range_end.min(end),
        None => range_end,
    };
    if lower > upper {
        return Ok(Vec::new());
    }

    // Schedule::after is exclusive of its argument; step back one second so
    // an instant exactly at the lower bound is kept.
    let mut runs = Vec::new();
    for instant in cron.after(&(lower - Duration::seconds(1))) {
        if instant > upper {
            break;
        }
        runs.push(instant);
    }
    Ok(runs)
}

/// Parses a crontab expression. Standard five-field expressions are
/// accepted by normalizing the seconds field the `cron` crate expects.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    let trimmed = expression.trim();
    let normalized = if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::MalformedCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}
