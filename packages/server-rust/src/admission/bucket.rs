//! Per-client token bucket.

use tokio::time::Instant;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Token bucket for one client identity.
///
/// `rate` and `burst` belong to the owning limiter and are passed in on every
/// check, so a bucket is just its mutable state.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: u32,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    /// A full bucket: first sight of a client grants the whole burst.
    #[must_use]
    pub fn new(burst: u32, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
            last_seen: now,
        }
    }

    /// Refills for the time elapsed since the last refill, then takes one
    /// token if any is available.
    ///
    /// Refill adds `floor(elapsed * rate)` tokens capped at `burst`.
    /// `last_refill` only moves when at least one token was added, so
    /// fractional progress carries over to the next check.
    pub fn try_acquire(&mut self, rate: u32, burst: u32, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = elapsed.as_nanos() * u128::from(rate) / NANOS_PER_SEC;
        if earned > 0 {
            let earned = u32::try_from(earned).unwrap_or(u32::MAX);
            self.tokens = self.tokens.saturating_add(earned).min(burst);
            self.last_refill = now;
        }
        self.last_seen = now;

        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    /// When this bucket was last checked.
    #[must_use]
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn burst_then_one_per_second() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(5, t0);

        for _ in 0..5 {
            assert!(bucket.try_acquire(1, 5, t0));
        }
        assert!(!bucket.try_acquire(1, 5, t0));

        let t1 = t0 + Duration::from_secs(1);
        assert!(bucket.try_acquire(1, 5, t1));
        assert!(!bucket.try_acquire(1, 5, t1));
    }

    #[test]
    fn fractional_progress_is_kept() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(1, t0);
        assert!(bucket.try_acquire(1, 1, t0));

        // Half a token's worth: nothing added, refill clock untouched.
        assert!(!bucket.try_acquire(1, 1, t0 + Duration::from_millis(500)));
        assert!(bucket.try_acquire(1, 1, t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn refill_is_capped_at_burst() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(3, t0);
        assert!(bucket.try_acquire(10, 3, t0));

        let later = t0 + Duration::from_secs(3600);
        assert!(bucket.try_acquire(10, 3, later));
        assert_eq!(bucket.tokens(), 2);
        assert_eq!(bucket.last_seen(), later);
    }

    #[test]
    fn zero_rate_never_refills() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(1, t0);
        assert!(bucket.try_acquire(0, 1, t0));
        assert!(!bucket.try_acquire(0, 1, t0 + Duration::from_secs(1000)));
    }

    proptest! {
        #[test]
        fn tokens_never_exceed_burst(
            rate in 0u32..1_000,
            burst in 1u32..500,
            steps in proptest::collection::vec(0u64..5_000, 1..50),
        ) {
            let t0 = Instant::now();
            let mut bucket = TokenBucket::new(burst, t0);
            let mut now = t0;
            for step in steps {
                now += Duration::from_millis(step);
                bucket.try_acquire(rate, burst, now);
                prop_assert!(bucket.tokens() < burst);
            }
        }
    }
}
