#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};

/// Current Unix time in seconds.
#[inline]
pub fn unix_now() -> i64 {
	Utc::now().timestamp()
}

/// Unix seconds to a timestamp; zero and negative values mean "never".
pub fn from_unix(secs: Option<i64>) -> Option<DateTime<Utc>> {
	secs.filter(|s| *s > 0).and_then(|s| DateTime::from_timestamp(s, 0))
}

/// Timestamp to Unix seconds; "never" (or the epoch) is stored as NULL.
pub fn to_unix(ts: Option<DateTime<Utc>>) -> Option<i64> {
	ts.map(|t| t.timestamp()).filter(|s| *s > 0)
}
