//! Classic 5-field cron specs for the gitvan daemon.
//!
//! A spec has minute, hour, day-of-month, month, and day-of-week fields.
//! Each field is `*`, a value, a range `a-b`, a step `*/s` or `a/s`, or a
//! comma union of those. Evaluation is minute-precision: a spec matches a
//! timestamp iff every field matches the timestamp's component, and the next
//! execution after an instant is found by walking forward minute by minute
//! with per-field pruning (mismatched months skip to the next month,
//! mismatched days to the next day).
//!
//! Invalid specs are rejected at parse time with a field-level message, so
//! the job registry can surface bad `cron:` entries when a job is
//! discovered rather than when it first fires.
//!
//! # Example
//!
//! ```
//! use chrono::NaiveDate;
//! use gitvan_cron::CronSpec;
//!
//! let spec: CronSpec = "*/15 9-17 * * 1-5".parse().unwrap();
//! let monday = NaiveDate::from_ymd_opt(2024, 3, 4)
//!     .unwrap()
//!     .and_hms_opt(9, 7, 0)
//!     .unwrap();
//! let next = spec.next_execution(monday).unwrap();
//! assert_eq!(next.format("%H:%M").to_string(), "09:15");
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize, de, ser};
use thiserror::Error;

/// Parse failure for a cron spec, with the offending field named.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("cron spec must have 5 fields (minute hour day month weekday), got {0}")]
    FieldCount(usize),
    #[error("invalid {field} field {text:?}: {reason}")]
    Field {
        field: &'static str,
        text: String,
        reason: String,
    },
}

const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day-of-month", "month", "day-of-week"];
const FIELD_RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 7)];

/// One alternative within a field's comma union.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Any,
    Value(u32),
    Range(u32, u32),
    /// `*/step`
    WildStep(u32),
    /// `a/step` - every `step` starting at `a`, to the field maximum.
    FromStep(u32, u32),
}

impl Part {
    fn matches(&self, v: u32, min: u32, max: u32) -> bool {
        match *self {
            Part::Any => true,
            Part::Value(n) => v == n,
            Part::Range(a, b) => v >= a && v <= b,
            // `*/s` steps from the field minimum, so day-of-month `*/5`
            // fires on the 1st, 6th, 11th and so on.
            Part::WildStep(s) => (v - min) % s == 0,
            Part::FromStep(a, s) => v >= a && v <= max && (v - a) % s == 0,
        }
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Part::Any => write!(f, "*"),
            Part::Value(n) => write!(f, "{n}"),
            Part::Range(a, b) => write!(f, "{a}-{b}"),
            Part::WildStep(s) => write!(f, "*/{s}"),
            Part::FromStep(a, s) => write!(f, "{a}/{s}"),
        }
    }
}

/// A single cron field: a comma union of parts.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    parts: Vec<Part>,
    min: u32,
    max: u32,
}

impl Field {
    fn matches(&self, v: u32) -> bool {
        self.parts.iter().any(|p| p.matches(v, self.min, self.max))
    }

    fn is_any(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::Any))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, p) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{p}")?;
        }
        Ok(())
    }
}

fn parse_field(text: &str, idx: usize) -> Result<Field, CronError> {
    let (min, max) = FIELD_RANGES[idx];
    let field_name = FIELD_NAMES[idx];
    let err = |reason: String| CronError::Field {
        field: field_name,
        text: text.to_string(),
        reason,
    };

    if text.is_empty() {
        return Err(err("empty field".to_string()));
    }

    let parse_num = |s: &str| -> Result<u32, CronError> {
        let n: u32 = s
            .parse()
            .map_err(|_| err(format!("{s:?} is not a number")))?;
        if n < min || n > max {
            return Err(err(format!("{n} outside {min}-{max}")));
        }
        Ok(n)
    };

    let mut parts = Vec::new();
    for piece in text.split(',') {
        let part = if piece == "*" {
            Part::Any
        } else if let Some((base, step)) = piece.split_once('/') {
            let step: u32 = step
                .parse()
                .map_err(|_| err(format!("step {step:?} is not a number")))?;
            if step == 0 {
                return Err(err("step must be at least 1".to_string()));
            }
            if base == "*" {
                Part::WildStep(step)
            } else {
                Part::FromStep(parse_num(base)?, step)
            }
        } else if let Some((a, b)) = piece.split_once('-') {
            let (a, b) = (parse_num(a)?, parse_num(b)?);
            if a > b {
                return Err(err(format!("range start {a} exceeds end {b}")));
            }
            Part::Range(a, b)
        } else {
            Part::Value(parse_num(piece)?)
        };
        parts.push(part);
    }

    Ok(Field { parts, min, max })
}

/// A parsed 5-field cron spec.
///
/// Parsing and formatting are inverse: `format(parse(s)) == s` modulo
/// whitespace, and `parse(format(spec)) == spec` exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl FromStr for CronSpec {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }
        Ok(CronSpec {
            minute: parse_field(fields[0], 0)?,
            hour: parse_field(fields[1], 1)?,
            day_of_month: parse_field(fields[2], 2)?,
            month: parse_field(fields[3], 3)?,
            day_of_week: parse_field(fields[4], 4)?,
        })
    }
}

impl fmt::Display for CronSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month, self.day_of_week
        )
    }
}

impl Serialize for CronSpec {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CronSpec {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl CronSpec {
    /// True iff every field matches `t`'s components (minute precision;
    /// seconds are ignored).
    pub fn matches(&self, t: NaiveDateTime) -> bool {
        self.matches_date(t) && self.hour.matches(t.hour()) && self.minute.matches(t.minute())
    }

    fn matches_date(&self, t: NaiveDateTime) -> bool {
        // Day-of-week 7 is an alias for Sunday (0).
        let dow = t.weekday().num_days_from_sunday();
        let dow_ok = self.day_of_week.matches(dow) || (dow == 0 && self.day_of_week.matches(7));
        self.month.matches(t.month()) && self.day_of_month.matches(t.day()) && dow_ok
    }

    /// Smallest `t > from` (rounded up to a minute boundary) matched by this
    /// spec, or `None` when no match exists within the search horizon
    /// (impossible dates such as `0 0 30 2 *`).
    pub fn next_execution(&self, from: NaiveDateTime) -> Option<NaiveDateTime> {
        // Round up to the next whole minute; a timestamp exactly on a
        // boundary still advances, keeping next_execution(t) > t.
        let mut t = from
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(from)
            + Duration::minutes(1);

        let horizon = from + Duration::days(366 * 4 + 1);

        while t <= horizon {
            if !self.month.matches(t.month()) {
                // Skip to the first minute of the next month.
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = chrono::NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.matches_date(t) {
                // Skip to midnight of the next day.
                t = (t.date() + Duration::days(1)).and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hour.matches(t.hour()) {
                t = t
                    .with_minute(0)
                    .map(|t| t + Duration::hours(1))
                    .unwrap_or(t + Duration::minutes(1));
                continue;
            }
            if self.minute.matches(t.minute()) {
                return Some(t);
            }
            t += Duration::minutes(1);
        }

        None
    }

    /// True when the spec fires every minute (`* * * * *`).
    pub fn is_every_minute(&self) -> bool {
        self.minute.is_any()
            && self.hour.is_any()
            && self.day_of_month.is_any()
            && self.month.is_any()
            && self.day_of_week.is_any()
    }
}
