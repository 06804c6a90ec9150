//! Single-task background worker driving periodic and on-demand work.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from an mpsc
//! channel via a `BackgroundRunnable` implementation, interleaved with a
//! re-armable tick timer. All work for one worker runs sequentially on one
//! tokio task, so the runnable never needs internal locking.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Instant};

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Trait for task handlers executed by `BackgroundWorker`.
///
/// Implementors define how individual tasks are processed, what happens on each
/// tick, and how to clean up on shutdown.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called when the tick timer fires. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker that processes tasks via an mpsc channel.
///
/// The worker spawns a tokio task that:
/// 1. Fires the first tick immediately
/// 2. Calls `BackgroundRunnable::run()` for each submitted task
/// 3. Calls `BackgroundRunnable::on_tick()` whenever the timer expires
/// 4. Re-arms the timer one full interval after every task or tick completes
/// 5. Calls `BackgroundRunnable::shutdown()` when stopped
///
/// Re-arming after completion means a slow tick delays the next one instead
/// of letting ticks pile up.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Start the background worker with the given runnable and tick interval.
    ///
    /// The task channel capacity is fixed at 64.
    pub fn start(mut runnable: R, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let timer = sleep(Duration::ZERO);
            tokio::pin!(timer);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => {
                        break;
                    }
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break, // Channel closed.
                        }
                    }
                    () = &mut timer => {
                        runnable.on_tick().await;
                    }
                }
                timer.as_mut().reset(Instant::now() + tick_interval);
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Returns a sender for submitting tasks, or `None` once stopped.
    #[must_use]
    pub fn sender(&self) -> Option<mpsc::Sender<R::Task>> {
        self.tx.clone()
    }

    /// Whether `stop()` has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.handle.is_none()
    }

    /// Stop the worker, waiting for any in-progress task or tick to finish.
    pub async fn stop(&mut self) {
        // Signal shutdown.
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Close the task channel.
        self.tx.take();
        // Wait for the worker task to finish.
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default)]
    struct Counters {
        runs: AtomicU32,
        ticks: AtomicU32,
        shutdowns: AtomicU32,
    }

    struct CountingRunnable {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = String;

        async fn run(&mut self, _task: String) {
            self.counters.runs.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.counters.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn start(interval: Duration) -> (BackgroundWorker<CountingRunnable>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let runnable = CountingRunnable {
            counters: Arc::clone(&counters),
        };
        (BackgroundWorker::start(runnable, interval), counters)
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_fires_immediately_then_each_interval() {
        let (mut worker, counters) = start(Duration::from_secs(30));

        sleep(Duration::from_millis(1)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 2);

        worker.stop().await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn task_rearms_the_timer() {
        let (mut worker, counters) = start(Duration::from_secs(30));
        sleep(Duration::from_millis(1)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 1);

        // A task at t=20s pushes the next tick out to t=50s.
        sleep(Duration::from_secs(20)).await;
        worker.sender().unwrap().send("flush".to_string()).await.unwrap();
        sleep(Duration::from_secs(15)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 1);
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(20)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 2);

        worker.stop().await;
    }

    #[tokio::test]
    async fn submitted_tasks_run() {
        let (mut worker, counters) = start(Duration::from_secs(60));
        let tx = worker.sender().unwrap();

        tx.send("task-1".to_string()).await.unwrap();
        tx.send("task-2".to_string()).await.unwrap();
        tx.send("task-3".to_string()).await.unwrap();
        drop(tx);

        // Give the worker time to process tasks.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 3);

        worker.stop().await;
        assert!(worker.is_stopped());
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sender_after_stop_is_none() {
        let (mut worker, _counters) = start(Duration::from_secs(60));
        let stale = worker.sender().unwrap();
        worker.stop().await;

        assert!(worker.sender().is_none());
        assert!(stale.send("late-task".to_string()).await.is_err());
    }
}
