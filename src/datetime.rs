//! Date/time utilities for Sealdrop.
//!
//! Timestamps are persisted as Unix milliseconds so that range queries
//! (`expires_at > now`, `run_at <= now`) compare integers rather than text.

use chrono::{DateTime, Duration, Utc};

/// Convert a UTC datetime to Unix milliseconds.
pub fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert Unix milliseconds to a UTC datetime.
///
/// Out-of-range values clamp to the Unix epoch.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Current time in Unix milliseconds.
pub fn now_millis() -> i64 {
    to_millis(&Utc::now())
}

/// Expiration instant of a transfer created at `created` living `hours` hours.
pub fn expiration_after(created: &DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    *created + Duration::hours(hours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_millis_roundtrip_truncates_to_millis() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        let millis = to_millis(&dt);

        assert_eq!(millis, 1_705_314_600_000);
        assert_eq!(from_millis(millis), dt);
    }

    #[test]
    fn test_from_millis_out_of_range() {
        assert_eq!(from_millis(i64::MAX), DateTime::<Utc>::default());
    }

    #[test]
    fn test_expiration_after() {
        let created = Utc.with_ymd_and_hms(2024, 12, 31, 23, 0, 0).unwrap();
        let expires = expiration_after(&created, 24);

        assert_eq!(expires, Utc.with_ymd_and_hms(2025, 1, 1, 23, 0, 0).unwrap());
    }

    #[test]
    fn test_now_millis_is_recent() {
        let before = to_millis(&Utc::now());
        let now = now_millis();
        assert!(now >= before);
        assert!(now - before < 5_000);
    }
}
