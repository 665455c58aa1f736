//! Timestamp helpers shared by gateway components.

use chrono::{SecondsFormat, Utc};

/// Current wall-clock time as Unix epoch milliseconds.
pub fn current_timestamp_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current wall-clock time as an RFC 3339 / ISO 8601 string (UTC, millisecond precision).
pub fn current_timestamp_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
