//! Periodic eviction of idle token buckets.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::limiter::RateLimiter;
use crate::service::worker::{BackgroundRunnable, BackgroundWorker};

/// On-demand work for the sweeper.
#[derive(Debug)]
pub enum SweepTask {
    /// Evict idle buckets now instead of waiting for the next tick.
    SweepNow,
}

/// Evicts buckets idle for longer than the limiter's `idle_ttl`.
pub struct BucketSweeper {
    limiter: Arc<RateLimiter>,
}

impl BucketSweeper {
    #[must_use]
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }

    /// Starts the sweeper on a background worker ticking every
    /// `sweep_interval`.
    #[must_use]
    pub fn spawn(limiter: Arc<RateLimiter>) -> BackgroundWorker<Self> {
        let interval = limiter.config().sweep_interval;
        BackgroundWorker::start(Self::new(limiter), interval)
    }

    fn sweep(&self) {
        let evicted = self.limiter.evict_idle(Instant::now());
        if evicted > 0 {
            debug!(
                evicted,
                remaining = self.limiter.len(),
                "evicted idle rate-limit buckets"
            );
        }
    }
}

#[async_trait]
impl BackgroundRunnable for BucketSweeper {
    type Task = SweepTask;

    fn name(&self) -> &'static str {
        "bucket-sweeper"
    }

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::SweepNow => self.sweep(),
        }
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::admission::RateLimitConfig;

    fn limiter_sweeping_every(sweep_interval: Duration) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimitConfig {
            rate: 1,
            burst: 1,
            max_buckets: 100,
            idle_ttl: Duration::from_secs(30),
            sweep_interval,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn tick_evicts_idle_buckets() {
        let limiter = limiter_sweeping_every(Duration::from_secs(10));
        limiter.check("a").ok();
        let mut worker = BucketSweeper::spawn(Arc::clone(&limiter));

        tokio::time::sleep(Duration::from_secs(25)).await;
        limiter.check("b").ok();
        assert_eq!(limiter.len(), 2);

        // "a" passes its ttl at 30s and is swept on the 30s or 40s tick;
        // "b" (seen at 25s) survives until 55s.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(limiter.len(), 1);
        assert!(limiter.tokens("b").is_some());

        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_now_runs_immediately() {
        let limiter = limiter_sweeping_every(Duration::from_secs(3600));
        limiter.check("a").ok();
        let mut worker = BucketSweeper::spawn(Arc::clone(&limiter));

        tokio::time::advance(Duration::from_secs(31)).await;
        worker.submit(SweepTask::SweepNow).await.unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(limiter.is_empty());

        worker.stop().await;
    }
}
