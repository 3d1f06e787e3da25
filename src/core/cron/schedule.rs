//! Cron schedules: expressions, natural-language phrases, or callables.
//!
//! Five-field expressions use standard cron day-of-week numbering
//! (0 and 7 are Sunday). All evaluation is in UTC.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use super::natural;

const MAX_WITHIN: usize = 100_000;
const DOW_NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Computes the next fire time strictly after a reference time.
pub type NextFn = Arc<dyn Fn(DateTime<Utc>) -> Option<DateTime<Utc>> + Send + Sync>;

/// When a cron entry fires.
#[derive(Clone)]
pub enum CronSchedule {
    /// Parsed cron expression.
    Expression {
        /// What the operator wrote.
        source: String,
        /// The expression handed to the cron parser.
        expression: String,
        /// Parsed schedule.
        schedule: Box<::cron::Schedule>,
    },
    /// Function of the previous fire time (or now).
    Callable(NextFn),
}

impl CronSchedule {
    /// Parse a cron expression or natural-language phrase.
    ///
    /// # Errors
    ///
    /// The parser message when neither form is recognised.
    pub fn parse(source: &str) -> Result<Self, String> {
        let resolved = natural::to_cron(source).unwrap_or_else(|| source.trim().to_string());
        let expression = normalize(&resolved)?;
        let schedule = ::cron::Schedule::from_str(&expression).map_err(|e| e.to_string())?;
        Ok(Self::Expression {
            source: source.to_string(),
            expression,
            schedule: Box::new(schedule),
        })
    }

    /// Schedule computed by `next`.
    pub fn callable(
        next: impl Fn(DateTime<Utc>) -> Option<DateTime<Utc>> + Send + Sync + 'static,
    ) -> Self {
        Self::Callable(Arc::new(next))
    }

    /// First fire time strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Expression { schedule, .. } => schedule.after(&after).next(),
            Self::Callable(next) => next(after).filter(|at| *at > after),
        }
    }

    /// Every fire time in `[start, end)`, ascending. Pure.
    #[must_use]
    pub fn within(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        if start >= end {
            return Vec::new();
        }
        match self {
            Self::Expression { schedule, .. } => {
                let from = start - TimeDelta::seconds(1);
                schedule
                    .after(&from)
                    .skip_while(|at| *at < start)
                    .take_while(|at| *at < end)
                    .take(MAX_WITHIN)
                    .collect()
            }
            Self::Callable(_) => {
                let mut times = Vec::new();
                let mut cursor = start - TimeDelta::nanoseconds(1);
                while times.len() < MAX_WITHIN {
                    match self.next_after(cursor) {
                        Some(at) if at < end => {
                            times.push(at);
                            cursor = at;
                        }
                        _ => break,
                    }
                }
                times
            }
        }
    }

    /// The expression, or `None` for callables.
    #[must_use]
    pub fn expression(&self) -> Option<&str> {
        match self {
            Self::Expression { expression, .. } => Some(expression),
            Self::Callable(_) => None,
        }
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expression {
                source, expression, ..
            } => f
                .debug_struct("Expression")
                .field("source", source)
                .field("expression", expression)
                .finish(),
            Self::Callable(_) => f.write_str("Callable(..)"),
        }
    }
}

/// Turn a five-field expression into the six-field seconds-first form,
/// translating numeric days of week. Six and seven fields pass through.
fn normalize(expression: &str) -> Result<String, String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = translate_dow(fields[4])?;
            Ok(format!(
                "0 {} {} {} {} {dow}",
                fields[0], fields[1], fields[2], fields[3]
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(format!("expected 5 to 7 fields, found {n}")),
    }
}

/// Expand numeric day-of-week items into day names; `0` and `7` are both
/// Sunday. Named items such as `MON-FRI` pass through.
fn translate_dow(field: &str) -> Result<String, String> {
    let mut days = [false; 7];
    let mut named: Vec<&str> = Vec::new();
    for item in field.split(',') {
        let expanded =
            dow_days(item).map_err(|reason| format!("day-of-week field `{field}`: {reason}"))?;
        match expanded {
            Some(expanded) => {
                for day in expanded {
                    days[day % 7] = true;
                }
            }
            None if item == "*" => return Ok(item.to_string()),
            None => {
                if !named.contains(&item) {
                    named.push(item);
                }
            }
        }
    }
    let items: Vec<&str> = DOW_NAMES[..7]
        .iter()
        .zip(days)
        .filter_map(|(name, on)| on.then_some(*name))
        .chain(named)
        .collect();
    Ok(items.join(","))
}

/// Days (0..=7) matched by one numeric item, `None` for named or bare `*`.
fn dow_days(item: &str) -> Result<Option<Vec<usize>>, String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => {
            let step: usize = step.parse().map_err(|_| format!("invalid step `{step}`"))?;
            if step == 0 {
                return Err("step must be positive".to_string());
            }
            (range, Some(step))
        }
        None => (item, None),
    };

    let day = |raw: &str| -> Result<Option<usize>, String> {
        if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
            return Ok(None);
        }
        match raw.parse::<usize>() {
            Ok(n) if n <= 7 => Ok(Some(n)),
            _ => Err(format!("day `{raw}` out of range 0-7")),
        }
    };

    let (from, to) = match (range, range.split_once('-')) {
        ("*", _) if step.is_some() => (0, 6),
        (_, Some((from, to))) => match (day(from)?, day(to)?) {
            (Some(from), Some(to)) if from > to => {
                return Err(format!("range `{range}` wraps around"));
            }
            (Some(from), Some(to)) => (from, to),
            _ => return Ok(None),
        },
        (_, None) => match day(range)? {
            Some(n) if step.is_some() => (n, 7),
            Some(n) => (n, n),
            None => return Ok(None),
        },
    };
    Ok(Some((from..=to).step_by(step.unwrap_or(1)).collect()))
}
