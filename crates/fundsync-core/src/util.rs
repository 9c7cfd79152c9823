//! Shared utility functions used across multiple modules.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Last value handed out by [`now_millis`].
static LAST_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Current Unix timestamp in milliseconds.
///
/// Strictly increasing within the process: two calls never return the same
/// value, even inside one wall-clock millisecond or across a clock step back.
pub fn now_millis() -> i64 {
    let wall = Utc::now().timestamp_millis();
    let previous = LAST_MILLIS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(wall.max(last + 1))
        })
        .unwrap_or(wall - 1);
    wall.max(previous + 1)
}

/// Make sure later [`now_millis`] calls land after `millis`.
///
/// Called with the newest timestamp found in a database on open.
pub fn observe_millis(millis: i64) {
    LAST_MILLIS.fetch_max(millis, Ordering::SeqCst);
}

/// Convert a stored Unix-ms timestamp back into a UTC datetime.
///
/// Out-of-range values clamp to the Unix epoch.
pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Stable-per-process hash of a user id, safe to put in logs.
pub fn user_fingerprint(user_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    hasher.finish()
}
