//! Injectable time source.
//!
//! All cooldown, persistence, and cache-TTL arithmetic goes through the
//! [`Clock`] capability so the escalation state machine can be driven by
//! tests with a manual clock instead of real sleeps.

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time in epoch milliseconds plus a sleep primitive.
pub trait Clock: Send + Sync + 'static {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;

    /// Sleep for `ms` milliseconds.
    fn sleep_ms(&self, ms: u64) -> impl Future<Output = ()> + Send;
}

/// Production clock backed by `SystemTime` and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }

    fn sleep_ms(&self, ms: u64) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(tokio::time::Duration::from_millis(ms))
    }
}

/// Format epoch milliseconds as an RFC 3339 UTC timestamp (second precision).
#[must_use]
pub fn rfc3339_ms(ms: u64) -> String {
    #[allow(clippy::cast_possible_wrap)]
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms as i64)
        .map_or_else(|| ms.to_string(), |dt| {
            dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339_epoch() {
        assert_eq!(rfc3339_ms(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_rfc3339_known_instant() {
        // 2024-05-01T12:00:00Z
        assert_eq!(rfc3339_ms(1_714_564_800_000), "2024-05-01T12:00:00Z");
    }

    #[test]
    fn test_system_clock_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
