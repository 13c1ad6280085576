//! Five-field cron schedules.
//!
//! Expressions use the classic `minute hour day-of-month month day-of-week` layout with
//! day-of-week 0-7 (0 and 7 are Sunday). They are translated to the seconds-first layout of
//! the `cron` crate, whose day-of-week field counts 1-7 starting at Sunday.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::ScheduleError;

/// A parsed five-field expression.
///
/// When both day-of-month and day-of-week are restricted, a day must match both of them.
/// Classic cron fires when either matches, so `0 0 1 * 1` here means "Mondays that fall on the
/// 1st" rather than "the 1st and every Monday".
#[derive(Clone)]
pub struct Schedule {
    expr: String,
    inner: cron::Schedule,
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount {
                expr: expr.to_string(),
                found: fields.len(),
            });
        }
        let dow = translate_day_of_week(fields[4]).map_err(|reason| ScheduleError::Invalid {
            expr: expr.to_string(),
            reason,
        })?;
        let translated = format!(
            "0 {} {} {} {} {}",
            fields[0], fields[1], fields[2], fields[3], dow
        );
        let inner = cron::Schedule::from_str(&translated).map_err(|e| ScheduleError::Invalid {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expr: fields.join(" "),
            inner,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First slot strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.after(&after).next()
    }

    /// The slot to fire for an evaluation window `(prev, now]`, if any.
    ///
    /// When several slots fall into the window (a long pause between ticks, or a daemon that was
    /// down), they collapse into the latest one: a window yields at most one fire, and a slot
    /// belongs to exactly one window as long as consecutive windows share their boundary.
    pub fn due(&self, prev: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if now <= prev {
            return None;
        }
        self.inner
            .after(&prev)
            .take_while(|slot| *slot <= now)
            .last()
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Schedule").field(&self.expr).finish()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Schedule::parse(s)
    }
}

/// Shifts numeric days of week from 0-7 (Sunday = 0 or 7) to 1-7 (Sunday = 1).
/// Names (`MON`, `Fri-Sun`) and `*` pass through unchanged.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    let mut out = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let suffix = step.map(|s| format!("/{}", s)).unwrap_or_default();
        if range == "*" || range.chars().any(|c| c.is_ascii_alphabetic()) {
            out.push(format!("{}{}", range, suffix));
            continue;
        }
        match range.split_once('-') {
            Some((lo, hi)) => {
                let lo = day_number(lo)?;
                let hi = day_number(hi)?;
                if hi == 7 && lo > 0 {
                    // `5-7` is Fri..Sun; Sunday wraps to the start of the 1-7 scale.
                    if step.is_some() {
                        return Err(format!("stepped range ending on Sunday ('{}') is not supported", item));
                    }
                    if lo < 7 {
                        out.push(format!("{}-7", lo + 1));
                    }
                    out.push("1".to_string());
                } else {
                    let hi = if hi == 7 { 6 } else { hi };
                    if lo > hi {
                        return Err(format!("day-of-week range '{}' is reversed", item));
                    }
                    out.push(format!("{}-{}{}", lo + 1, hi + 1, suffix));
                }
            }
            None => {
                let day = day_number(range)? % 7;
                out.push(format!("{}{}", day + 1, suffix));
            }
        }
    }
    Ok(out.join(","))
}

fn day_number(value: &str) -> Result<u32, String> {
    match value.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("invalid day of week '{}'", value)),
    }
}
