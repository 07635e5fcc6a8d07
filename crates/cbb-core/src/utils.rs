use std::time::Duration;

use chrono::Utc;
use rand::Rng;

// ============== Timestamp Helpers ==============

/// RFC3339 timestamp in UTC (for logs and persisted records).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

// ============== Text Helpers ==============

/// Truncate to `max_len` characters, appending `...` when something was cut.
pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    format!("{}...", s.chars().take(max_len).collect::<String>())
}

// ============== Randomized Delays ==============

/// Uniformly random duration in `[min, max]` (inclusive, millisecond precision).
pub fn random_between(min: Duration, max: Duration) -> Duration {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    let lo_ms = lo.as_millis() as u64;
    let hi_ms = hi.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(lo_ms..=hi_ms))
}
