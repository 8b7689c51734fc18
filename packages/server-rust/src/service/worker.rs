//! A spawned task that owns a [`BackgroundRunnable`] and feeds it queued
//! work plus a periodic tick. The admission bucket sweeper is its main user.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Capacity of the queue behind [`BackgroundWorker::submit`].
const QUEUE_DEPTH: usize = 64;

/// The worker loop has exited; nothing more can be queued.
#[derive(Debug, thiserror::Error)]
#[error("background worker `{0}` is not running")]
pub struct WorkerStopped(pub &'static str);

#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Label attached to the worker's log lines.
    fn name(&self) -> &'static str;

    async fn run(&mut self, task: Self::Task);

    async fn on_tick(&mut self) {}

    /// Runs once after the loop exits, before the task finishes.
    async fn shutdown(&mut self) {}
}

/// Owner of the spawned loop. Dropping it without [`stop`](Self::stop)
/// closes the queue, which also ends the loop.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    name: &'static str,
    queue: Option<mpsc::Sender<R::Task>>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the loop; the first `on_tick` fires one full `tick_interval`
    /// after start.
    pub fn start(runnable: R, tick_interval: Duration) -> Self {
        let name = runnable.name();
        let (queue, rx) = mpsc::channel(QUEUE_DEPTH);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(drive(runnable, rx, stop_rx, tick_interval));

        Self {
            name,
            queue: Some(queue),
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Queues `task`, waiting for room if the queue is full.
    ///
    /// # Errors
    ///
    /// [`WorkerStopped`] once the loop has exited or `stop` was called.
    pub async fn submit(&self, task: R::Task) -> Result<(), WorkerStopped> {
        let queue = self.queue.as_ref().ok_or(WorkerStopped(self.name))?;
        queue.send(task).await.map_err(|_| WorkerStopped(self.name))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signals the loop and waits for `shutdown` to complete. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        self.queue = None;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn drive<R: BackgroundRunnable>(
    mut runnable: R,
    mut queue: mpsc::Receiver<R::Task>,
    mut stop: oneshot::Receiver<()>,
    tick_interval: Duration,
) {
    let name = runnable.name();
    let start = tokio::time::Instant::now() + tick_interval;
    let mut ticker = tokio::time::interval_at(start, tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(worker = name, "started");

    loop {
        tokio::select! {
            next = queue.recv() => match next {
                Some(task) => runnable.run(task).await,
                None => break,
            },
            _ = ticker.tick() => runnable.on_tick().await,
            _ = &mut stop => break,
        }
    }

    runnable.shutdown().await;
    debug!(worker = name, "stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default, Clone)]
    struct Counters {
        runs: Arc<AtomicU32>,
        ticks: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    struct CountingRunnable(Counters);

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = u32;

        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&mut self, task: u32) {
            self.0.runs.fetch_add(task, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_tasks_run_before_stop() {
        let counters = Counters::default();
        let mut worker =
            BackgroundWorker::start(CountingRunnable(counters.clone()), Duration::from_secs(60));

        worker.submit(1).await.unwrap();
        worker.submit(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 3);
        assert!(worker.is_running());

        worker.stop().await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_fires_once_per_interval() {
        let counters = Counters::default();
        let mut worker =
            BackgroundWorker::start(CountingRunnable(counters.clone()), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        worker.stop().await;

        assert_eq!(counters.ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stopped_worker_rejects_tasks() {
        let mut worker = BackgroundWorker::start(
            CountingRunnable(Counters::default()),
            Duration::from_secs(60),
        );
        worker.stop().await;
        let err = worker.submit(1).await.unwrap_err();
        assert_eq!(err.to_string(), "background worker `counting` is not running");
    }
}
