//! Wall-clock abstraction for record timestamps.
//!
//! Records carry second-resolution timestamps. Every component that stamps
//! a record reads time through [`ClockSource`] so tests can pin the clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Abstraction over the system clock for dependency injection.
///
/// The default implementation ([`SystemClock`]) delegates to
/// `std::time::SystemTime`; [`ManualClock`] is a settable clock for tests.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as whole seconds since the Unix epoch.
    fn now_secs(&self) -> i64;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    #[allow(clippy::cast_possible_wrap)]
    fn now_secs(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicI64,
}

impl ManualClock {
    /// Creates a clock reading `secs` seconds since the epoch.
    #[must_use]
    pub fn new(secs: i64) -> Self {
        Self {
            secs: AtomicI64::new(secs),
        }
    }

    /// Sets the current reading.
    pub fn set(&self, secs: i64) {
        self.secs.store(secs, Ordering::SeqCst);
    }

    /// Moves the clock forward by `secs` seconds.
    pub fn advance(&self, secs: i64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_secs(&self) -> i64 {
        self.secs.load(Ordering::SeqCst)
    }
}

/// Converts seconds since the epoch into a UTC timestamp.
///
/// Returns `None` when the value is outside chrono's representable range.
#[must_use]
pub fn from_unix_secs(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_returns_nonzero() {
        let clock = SystemClock;
        assert!(clock.now_secs() > 0);
    }

    #[test]
    fn manual_clock_set_and_advance() {
        let clock = ManualClock::new(1_700_000_000);
        assert_eq!(clock.now_secs(), 1_700_000_000);

        clock.advance(5);
        assert_eq!(clock.now_secs(), 1_700_000_005);

        clock.set(42);
        assert_eq!(clock.now_secs(), 42);
    }

    #[test]
    fn from_unix_secs_round_trips_seconds() {
        let ts = from_unix_secs(1_700_000_000).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert!(from_unix_secs(i64::MAX).is_none());
    }
}
