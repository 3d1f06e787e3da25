//! English schedule phrases resolved to five-field cron expressions.
//!
//! Recognised forms, case-insensitive:
//!
//! - `every minute`, `every 15 minutes`, `every hour`, `every 6 hours`
//! - `hourly`, `daily`, `weekly`, `monthly`, `yearly` / `annually`
//! - `@hourly`, `@daily`, `@midnight`, `@weekly`, `@monthly`, `@yearly`, `@annually`
//! - `every day [at <time>]`, `every weekday [at <time>]`, `every weekend [at <time>]`
//! - `every <dayname> [at <time>]`
//!
//! `<time>` is `noon`, `midnight`, `5pm`, `5:30pm`, `5:30 pm` or `17:30`.

const DAYS: [(&str, u8); 7] = [
    ("sunday", 0),
    ("monday", 1),
    ("tuesday", 2),
    ("wednesday", 3),
    ("thursday", 4),
    ("friday", 5),
    ("saturday", 6),
];

/// Resolve `phrase` to a five-field cron expression.
#[must_use]
pub fn to_cron(phrase: &str) -> Option<String> {
    let normalized = phrase.trim().to_ascii_lowercase();
    let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");

    let fixed = match normalized.as_str() {
        "every minute" => Some("* * * * *"),
        "every hour" | "hourly" | "@hourly" => Some("0 * * * *"),
        "every day" | "daily" | "@daily" | "@midnight" => Some("0 0 * * *"),
        "every week" | "weekly" | "@weekly" => Some("0 0 * * 0"),
        "every month" | "monthly" | "@monthly" => Some("0 0 1 * *"),
        "every year" | "yearly" | "annually" | "@yearly" | "@annually" => Some("0 0 1 1 *"),
        _ => None,
    };
    if let Some(expression) = fixed {
        return Some(expression.to_string());
    }

    let rest = normalized.strip_prefix("every ")?;
    if let Some(expression) = interval(rest) {
        return Some(expression);
    }

    let (day_part, time_part) = match rest.split_once(" at ") {
        Some((day, time)) => (day, Some(time)),
        None => (rest, None),
    };
    let (hour, minute) = time_part.map_or(Some((0, 0)), parse_time)?;
    let dow = match day_part {
        "day" => "*".to_string(),
        "weekday" => "1-5".to_string(),
        "weekend" => "0,6".to_string(),
        name => day_number(name)?.to_string(),
    };
    Some(format!("{minute} {hour} * * {dow}"))
}

fn interval(rest: &str) -> Option<String> {
    let (count, unit) = rest.split_once(' ')?;
    let count: u32 = count.parse().ok()?;
    match unit {
        "minutes" | "minute" if (1..60).contains(&count) => Some(format!("*/{count} * * * *")),
        "hours" | "hour" if (1..24).contains(&count) => Some(format!("0 */{count} * * *")),
        _ => None,
    }
}

fn day_number(name: &str) -> Option<u8> {
    let singular = name.strip_suffix('s').unwrap_or(name);
    DAYS.iter()
        .find(|(day, _)| *day == singular || day.get(..3) == Some(singular))
        .map(|(_, n)| *n)
}

/// Parse `noon`, `midnight`, `5pm`, `5:30 pm` or `17:30` into (hour, minute).
fn parse_time(raw: &str) -> Option<(u32, u32)> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    match compact.as_str() {
        "noon" => return Some((12, 0)),
        "midnight" => return Some((0, 0)),
        _ => {}
    }

    let (clock, meridiem) = if let Some(t) = compact.strip_suffix("am") {
        (t, Some(false))
    } else if let Some(t) = compact.strip_suffix("pm") {
        (t, Some(true))
    } else {
        (compact.as_str(), None)
    };

    let (hour, minute) = match clock.split_once(':') {
        Some((h, m)) => (h.parse::<u32>().ok()?, m.parse::<u32>().ok()?),
        None => (clock.parse::<u32>().ok()?, 0),
    };
    if minute > 59 {
        return None;
    }
    let hour = match meridiem {
        Some(pm) => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            match (hour, pm) {
                (12, false) => 0,
                (12, true) => 12,
                (h, true) => h + 12,
                (h, false) => h,
            }
        }
        None if hour < 24 => hour,
        None => return None,
    };
    Some((hour, minute))
}
