//! Task windows: the time interval of data a scheduled run covers.
//!
//! For a schedule time `t` the window is
//! `[truncate(t + offset) - size, truncate(t + offset))`. Truncation units
//! form a closed set; anything else is rejected when the spec is loaded.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use crate::models::SpecError;

/// Closed set of window truncation units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TruncateUnit {
    Hour,
    Day,
    Week,
    Month,
}

impl TruncateUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TruncateUnit::Hour => "h",
            TruncateUnit::Day => "d",
            TruncateUnit::Week => "w",
            TruncateUnit::Month => "M",
        }
    }

    /// Floors `t` to the unit boundary. Weeks start on Monday 00:00 UTC;
    /// months on the first day of the month.
    pub fn truncate(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = t
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|n| n.and_utc())
            .unwrap_or(t);
        match self {
            TruncateUnit::Hour => midnight + Duration::hours(i64::from(t.hour())),
            TruncateUnit::Day => midnight,
            TruncateUnit::Week => {
                midnight - Duration::days(i64::from(t.weekday().num_days_from_monday()))
            }
            TruncateUnit::Month => midnight - Duration::days(i64::from(t.day0())),
        }
    }
}

impl FromStr for TruncateUnit {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h" => Ok(TruncateUnit::Hour),
            "d" => Ok(TruncateUnit::Day),
            "w" => Ok(TruncateUnit::Week),
            "M" => Ok(TruncateUnit::Month),
            other => Err(SpecError::UnsupportedTruncateUnit(other.to_string())),
        }
    }
}

/// Data window of a task: size and offset relative to the truncated
/// schedule time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    size: Duration,
    offset: Duration,
    truncate_to: TruncateUnit,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            size: Duration::hours(24),
            offset: Duration::zero(),
            truncate_to: TruncateUnit::Day,
        }
    }
}

impl Window {
    pub fn new(size: Duration, offset: Duration, truncate_to: TruncateUnit) -> Result<Self, SpecError> {
        if size <= Duration::zero() {
            return Err(SpecError::NonPositiveWindowSize);
        }
        Ok(Self {
            size,
            offset,
            truncate_to,
        })
    }

    /// Parses `size`/`offset` duration strings (`"24h"`, `"1h30m"`, `"0"`)
    /// and a truncation unit from the closed set.
    pub fn parse(size: &str, offset: &str, truncate_to: &str) -> Result<Self, SpecError> {
        Self::new(
            parse_duration(size)?,
            parse_duration(offset)?,
            truncate_to.parse()?,
        )
    }

    pub fn size(&self) -> Duration {
        self.size
    }

    pub fn offset(&self) -> Duration {
        self.offset
    }

    pub fn truncate_to(&self) -> TruncateUnit {
        self.truncate_to
    }

    pub fn size_string(&self) -> String {
        render_duration(self.size)
    }

    pub fn offset_string(&self) -> String {
        render_duration(self.offset)
    }

    /// Data interval covered by a run scheduled at `t`: end-exclusive
    /// `[truncate(t + offset) - size, truncate(t + offset))`.
    pub fn interval(&self, t: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = self.truncate_to.truncate(t + self.offset);
        (end - self.size, end)
    }
}

fn parse_duration(s: &str) -> Result<Duration, SpecError> {
    let s = s.trim();
    if s.is_empty() || s == "0" {
        return Ok(Duration::zero());
    }
    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let mut total = Duration::zero();
    let mut digits = String::new();
    let mut consumed = false;
    for c in rest.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let amount: i64 = digits
            .parse()
            .map_err(|_| SpecError::MalformedDuration(s.to_string()))?;
        digits.clear();
        consumed = true;
        total = total
            + match c {
                'h' => Duration::hours(amount),
                'm' => Duration::minutes(amount),
                's' => Duration::seconds(amount),
                _ => return Err(SpecError::MalformedDuration(s.to_string())),
            };
    }
    if !digits.is_empty() || !consumed {
        return Err(SpecError::MalformedDuration(s.to_string()));
    }
    Ok(if negative { -total } else { total })
}

fn render_duration(d: Duration) -> String {
    if d == Duration::zero() {
        return "0".to_string();
    }
    let (sign, d) = if d < Duration::zero() {
        ("-", -d)
    } else {
        ("", d)
    };
    let total_seconds = d.num_seconds();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let mut out = sign.to_string();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if seconds > 0 {
        out.push_str(&format!("{}s", seconds));
    }
    out
}
