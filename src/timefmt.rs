//! Fleet timestamp format (`YYYY-MM-DD-HH:MM:SS`, device local time).

use chrono::{DateTime, Local, NaiveDateTime};

/// strftime pattern used on the wire and in local records.
pub const FLEET_FORMAT: &str = "%Y-%m-%d-%H:%M:%S";

/// Naive layouts accepted on input, all interpreted as local time.
const NAIVE_INPUT_FORMATS: &[&str] = &[FLEET_FORMAT, "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Current local time rendered in the fleet format.
#[must_use]
pub fn now_string() -> String {
    format(&Local::now())
}

#[must_use]
pub fn format(ts: &DateTime<Local>) -> String {
    ts.format(FLEET_FORMAT).to_string()
}

/// Parse a fleet or RFC 3339 timestamp. Returns `None` for anything else.
#[must_use]
pub fn parse(raw: &str) -> Option<DateTime<Local>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Local));
    }
    NAIVE_INPUT_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(raw, fmt)
            .ok()
            .and_then(|naive| naive.and_local_timezone(Local).earliest())
    })
}
