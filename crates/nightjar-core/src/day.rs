//! UTC calendar-day helpers.
//!
//! The daily trigger gate, the new-day progress reset, and output file
//! naming all reason about "the current day" in UTC. Keeping the
//! arithmetic here means every component agrees on where a day begins.

use chrono::{DateTime, Utc};

/// The placeholder substituted into output file name patterns.
pub const DATE_PLACEHOLDER: &str = "{date}";

/// Formats an instant as its UTC day key, `YYYYMMDD`.
#[must_use]
pub fn day_key(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d").to_string()
}

/// Returns true when both instants fall on the same UTC calendar day.
#[must_use]
pub fn same_utc_day(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.date_naive() == b.date_naive()
}

/// Renders a file name pattern, substituting `{date}` with the UTC day
/// key of `now`.
///
/// Patterns without the placeholder are returned unchanged.
#[must_use]
pub fn render_file_name(pattern: &str, now: DateTime<Utc>) -> String {
    pattern.replace(DATE_PLACEHOLDER, &day_key(now))
}
