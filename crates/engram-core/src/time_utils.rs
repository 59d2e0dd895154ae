use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Current Unix time in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    u64::try_from(since_epoch().as_millis()).unwrap_or(u64::MAX)
}

/// Current Unix time in whole seconds.
pub fn current_unix_timestamp() -> u64 {
    since_epoch().as_secs()
}

/// Converts a whole number of days into milliseconds.
pub fn days_to_ms(days: u64) -> u64 {
    days.saturating_mul(24 * 60 * 60 * 1_000)
}
