//! Shared helpers and constants.

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};

pub const APP_NAME: &str = "threadline_backend";

/// Fixed-width RFC 3339 timestamp so stored values sort lexicographically.
pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Renders a stored timestamp as a clock time such as `3:07 PM`.
pub fn clock_time(iso: &str, offset: FixedOffset) -> String {
    DateTime::parse_from_rfc3339(iso)
        .map(|dt| dt.with_timezone(&offset).format("%-I:%M %p").to_string())
        .unwrap_or_default()
}

/// Coarse relative age (`just now`, `5 minutes ago`, `2 days ago`).
pub fn time_since(iso: &str) -> String {
    let Ok(then) = DateTime::parse_from_rfc3339(iso) else {
        return String::new();
    };
    let elapsed = Utc::now().signed_duration_since(then.with_timezone(&Utc));
    let (value, unit) = if elapsed.num_days() >= 1 {
        (elapsed.num_days(), "day")
    } else if elapsed.num_hours() >= 1 {
        (elapsed.num_hours(), "hour")
    } else if elapsed.num_minutes() >= 1 {
        (elapsed.num_minutes(), "minute")
    } else {
        return "just now".into();
    };
    let plural = if value == 1 { "" } else { "s" };
    format!("{value} {unit}{plural} ago")
}
