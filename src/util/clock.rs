//! Wall-clock helpers shared by the scheduler, cron manager, and store.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeDelta, Utc};

/// Current wall-clock time in UTC.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Offset a timestamp by a std duration, saturating at the input on overflow.
#[must_use]
pub fn add(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(at)
}

/// Offset a timestamp backwards by a std duration.
#[must_use]
pub fn sub(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_sub_signed(delta))
        .unwrap_or(at)
}

/// Time remaining until `target`, zero if it already passed.
#[must_use]
pub fn until(target: DateTime<Utc>) -> Duration {
    (target - now()).to_std().unwrap_or(Duration::ZERO)
}
