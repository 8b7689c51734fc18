//! Identity → token bucket map with bounded size.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kvstore_core::{KvError, KvResult};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::bucket::TokenBucket;
use crate::metrics as kv_metrics;

/// Admission control settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub rate: u32,
    /// Bucket capacity and the allowance granted to a new identity.
    pub burst: u32,
    /// Upper bound on tracked identities.
    pub max_buckets: usize,
    /// A bucket unseen for this long may be evicted.
    pub idle_ttl: Duration,
    /// How often the sweeper evicts idle buckets. Also the minimum gap
    /// between sweeps forced by a full map.
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: 100,
            burst: 200,
            max_buckets: 100_000,
            idle_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Per-identity token bucket rate limiter.
///
/// The map and the buckets are locked separately: a bucket's `Arc` is cloned
/// out of the map before its mutex is taken, so refill/consume never holds a
/// shard lock. Sweeping takes shard locks and then bucket locks, never the
/// reverse.
///
/// `max_buckets` is enforced on insert. Concurrent first sightings of
/// different identities may overshoot it by at most the number of racing
/// inserts. A new identity arriving at capacity triggers at most one full
/// sweep per `sweep_interval`; in between, it is rejected without a scan.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
    config: RateLimitConfig,
    last_forced_sweep: Mutex<Option<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
            last_forced_sweep: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Checks and consumes one token for `identity` at the current time.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::RateLimited`] when the identity is out of tokens,
    /// or when it is new and the map is full of active buckets.
    pub fn check(&self, identity: &str) -> KvResult<()> {
        self.check_at(identity, Instant::now())
    }

    /// [`check`](Self::check) at an explicit instant.
    ///
    /// # Errors
    ///
    /// See [`check`](Self::check).
    pub fn check_at(&self, identity: &str, now: Instant) -> KvResult<()> {
        let existing = self.buckets.get(identity).map(|b| Arc::clone(b.value()));
        let bucket = match existing {
            Some(bucket) => bucket,
            None => self.insert(identity, now)?,
        };

        let admitted = bucket
            .lock()
            .try_acquire(self.config.rate, self.config.burst, now);
        kv_metrics::admission(admitted);
        if admitted {
            Ok(())
        } else {
            debug!(identity, "request rate limited");
            Err(KvError::RateLimited)
        }
    }

    fn insert(&self, identity: &str, now: Instant) -> KvResult<Arc<Mutex<TokenBucket>>> {
        if self.buckets.len() >= self.config.max_buckets {
            self.forced_sweep(now);
            if self.buckets.len() >= self.config.max_buckets {
                kv_metrics::admission(false);
                warn!(
                    identity,
                    max_buckets = self.config.max_buckets,
                    "bucket map full of active clients, rejecting new identity"
                );
                return Err(KvError::RateLimited);
            }
        }

        let burst = self.config.burst;
        let bucket = Arc::clone(
            self.buckets
                .entry(identity.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(burst, now))))
                .value(),
        );
        kv_metrics::admission_buckets(self.buckets.len());
        Ok(bucket)
    }

    /// Sweeps on behalf of a full map, unless another caller is already
    /// sweeping or the last forced sweep is younger than `sweep_interval`.
    fn forced_sweep(&self, now: Instant) {
        let Some(mut last) = self.last_forced_sweep.try_lock() else {
            return;
        };
        if let Some(prev) = *last {
            if now.saturating_duration_since(prev) < self.config.sweep_interval {
                return;
            }
        }
        *last = Some(now);
        drop(last);

        let evicted = self.evict_idle(now);
        debug!(evicted, "bucket map full, forced idle sweep");
    }

    /// Drops buckets not seen within `idle_ttl` of `now`. Returns how many
    /// were removed.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let ttl = self.config.idle_ttl;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.lock().last_seen()) < ttl);
        let after = self.buckets.len();
        kv_metrics::admission_buckets(after);
        before.saturating_sub(after)
    }

    /// Number of tracked identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Tokens currently held by `identity`, if it is tracked.
    #[must_use]
    pub fn tokens(&self, identity: &str) -> Option<u32> {
        self.buckets.get(identity).map(|b| b.lock().tokens())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            rate,
            burst,
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn rate_one_burst_five() {
        let limiter = limiter(1, 5);
        let t0 = Instant::now();

        for _ in 0..5 {
            assert!(limiter.check_at("10.0.0.1", t0).is_ok());
        }
        assert_eq!(limiter.check_at("10.0.0.1", t0), Err(KvError::RateLimited));

        let t1 = t0 + Duration::from_secs(1);
        assert!(limiter.check_at("10.0.0.1", t1).is_ok());
        assert_eq!(limiter.check_at("10.0.0.1", t1), Err(KvError::RateLimited));
    }

    #[test]
    fn two_hundred_admitted_then_rejected() {
        let limiter = limiter(100, 200);
        let t0 = Instant::now();

        for i in 0..200 {
            assert!(limiter.check_at("client", t0).is_ok(), "request {i}");
        }
        assert_eq!(limiter.check_at("client", t0), Err(KvError::RateLimited));
    }

    #[test]
    fn identities_are_independent() {
        let limiter = limiter(1, 1);
        let t0 = Instant::now();

        assert!(limiter.check_at("a", t0).is_ok());
        assert!(limiter.check_at("a", t0).is_err());
        assert!(limiter.check_at("b", t0).is_ok());
        assert_eq!(limiter.len(), 2);
        assert_eq!(limiter.tokens("a"), Some(0));
        assert_eq!(limiter.tokens("zz"), None);
    }

    #[test]
    fn full_map_rejects_new_identity_unless_idle() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rate: 1,
            burst: 5,
            max_buckets: 2,
            idle_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        });
        let t0 = Instant::now();

        assert!(limiter.check_at("a", t0).is_ok());
        assert!(limiter.check_at("b", t0).is_ok());
        assert_eq!(limiter.check_at("c", t0), Err(KvError::RateLimited));
        assert_eq!(limiter.len(), 2);

        // Known identities are still served at capacity.
        assert!(limiter.check_at("a", t0 + Duration::from_secs(30)).is_ok());

        // "b" has gone idle; it is evicted to make room for "c".
        let t1 = t0 + Duration::from_secs(61);
        assert!(limiter.check_at("c", t1).is_ok());
        assert_eq!(limiter.len(), 2);
        assert_eq!(limiter.tokens("b"), None);
        assert!(limiter.tokens("a").is_some());
    }

    #[test]
    fn full_map_sweeps_at_most_once_per_interval() {
        let limiter = RateLimiter::new(RateLimitConfig {
            rate: 1,
            burst: 5,
            max_buckets: 2,
            idle_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        });
        let t0 = Instant::now();
        assert!(limiter.check_at("a", t0).is_ok());
        assert!(limiter.check_at("b", t0 + Duration::from_secs(15)).is_ok());

        // Sweeps, but nothing is idle yet.
        let swept_at = t0 + Duration::from_secs(58);
        assert_eq!(limiter.check_at("c", swept_at), Err(KvError::RateLimited));

        // "a" is idle now, but the last sweep is too recent to repeat.
        for i in 0..100 {
            let now = swept_at + Duration::from_secs(4);
            let identity = format!("cycled-{i}");
            assert_eq!(limiter.check_at(&identity, now), Err(KvError::RateLimited));
        }
        assert!(limiter.tokens("a").is_some());
        assert_eq!(limiter.len(), 2);

        let later = swept_at + Duration::from_secs(11);
        assert!(limiter.check_at("d", later).is_ok());
        assert_eq!(limiter.tokens("a"), None);
        assert!(limiter.tokens("b").is_some());
    }

    #[test]
    fn evict_idle_keeps_recent_buckets() {
        let limiter = limiter(1, 1);
        let t0 = Instant::now();
        limiter.check_at("old", t0).ok();
        limiter
            .check_at("new", t0 + Duration::from_secs(500))
            .ok();

        assert_eq!(limiter.evict_idle(t0 + Duration::from_secs(601)), 1);
        assert_eq!(limiter.tokens("old"), None);
        assert!(limiter.tokens("new").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_sightings_create_one_bucket_each() {
        let limiter = Arc::new(limiter(0, 3));
        let mut handles = Vec::new();
        for i in 0..64 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let identity = format!("client-{}", i % 8);
                limiter.check(&identity).is_ok()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(limiter.len(), 8);
        // Eight identities, three tokens each, no refill.
        assert_eq!(admitted, 24);
    }
}
