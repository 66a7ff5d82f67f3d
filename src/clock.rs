//! Clock abstractions used by buckets, windows, cooldowns, and queue expiry.
//!
//! Every time-based decision in the crate reads time through [`Clock`] so tests can drive it
//! with [`ManualClock`]. Values are wall-clock milliseconds since the Unix epoch: queue expiry and
//! business-hours adjustments must survive restarts and agree across processes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;

    /// Whole seconds since the Unix epoch.
    fn now_secs(&self) -> u64 {
        self.now_millis() / 1000
    }
}

/// Wall clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock; clones share the same instant.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start the clock at `millis` since the epoch.
    pub fn new(millis: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(millis)) }
    }

    /// Move time forward.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump to an absolute instant.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// UTC calendar view of an epoch timestamp, used by time-of-day policies and anomaly features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarTime {
    /// Hour of day, 0..=23.
    pub hour: u32,
    /// Day of week, Monday = 0 .. Sunday = 6.
    pub weekday: u32,
}

impl CalendarTime {
    /// Convert epoch milliseconds into hour/weekday (UTC).
    pub fn from_millis(millis: u64) -> Self {
        let ts = i64::try_from(millis).unwrap_or(i64::MAX);
        match DateTime::<Utc>::from_timestamp_millis(ts) {
            Some(dt) => Self { hour: dt.hour(), weekday: dt.weekday().num_days_from_monday() },
            None => Self { hour: 0, weekday: 0 },
        }
    }

    /// Monday through Friday.
    pub fn is_weekday(&self) -> bool {
        self.weekday < 5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_and_shares_state() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();
        clock.advance(500);
        assert_eq!(other.now_millis(), 1_500);
        other.set(42_000);
        assert_eq!(clock.now_secs(), 42);
    }

    #[test]
    fn calendar_time_for_known_instant() {
        // 2024-01-01T10:30:00Z was a Monday.
        let cal = CalendarTime::from_millis(1_704_105_000_000);
        assert_eq!(cal.hour, 10);
        assert_eq!(cal.weekday, 0);
        assert!(cal.is_weekday());

        // 2024-01-06T23:00:00Z was a Saturday.
        let cal = CalendarTime::from_millis(1_704_582_000_000);
        assert_eq!(cal.hour, 23);
        assert_eq!(cal.weekday, 5);
        assert!(!cal.is_weekday());
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
