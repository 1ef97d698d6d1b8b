// Time types used across the project.
//
// All persisted timestamps are UTC instants. Scheduling decisions (retry
// due times, TTL expiry, reconciliation windows) are made against the same
// clock so that rows written by one worker sort correctly for another.

use chrono::{DateTime, Duration, Utc};

pub type Timestamp = DateTime<Utc>;

// Millis timestamps used where a plain integer is more convenient (metrics,
// log correlation)
pub type TimestampMillis = u64;

#[inline]
pub fn now() -> Timestamp {
    Utc::now()
}

// Return timestamp in milliseconds
// We cast it to u64 as we have plenty of time before it overflows
pub fn now_millis() -> TimestampMillis {
    Utc::now().timestamp_millis() as TimestampMillis
}

// Due time helper for retry scheduling
pub fn after_secs(secs: u64) -> Timestamp {
    Utc::now() + Duration::seconds(secs as i64)
}

// True when the given due time has passed
pub fn is_due(at: &Timestamp) -> bool {
    *at <= Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_times_order() {
        let past = now() - Duration::seconds(5);
        let future = after_secs(5);
        assert!(is_due(&past));
        assert!(!is_due(&future));
    }
}
