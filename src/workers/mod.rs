//! Background workers and the runtime that drives them.
//!
//! Each stage worker implements [`Processor`]; the [`Worker`] runtime invokes
//! it immediately on start and then on a fixed interval, retrying a failed
//! tick a bounded number of times with linear backoff before parking the
//! worker in an `error: …` status until the next tick. Workers never share
//! in-process state with each other; everything they coordinate on lives in
//! the queues and the payload metadata.

pub mod cleanup;
pub mod ingest;
pub mod transfer;
pub mod validation;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Poll interval shared by the queue-driven workers.
pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// How long a dequeued message stays hidden while a worker processes it.
pub const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

pub const STATUS_STOPPED: &str = "stopped";
pub const STATUS_RUNNING: &str = "running";

/// A batch-processing function run by the worker runtime.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Process up to `batch_size` items. An `Err` fails the whole tick and
    /// triggers the runtime's in-tick retry.
    async fn process(&self, shutdown: &CancellationToken, batch_size: usize)
        -> anyhow::Result<()>;
}

/// Shared view of a worker's status and last run, handed to the status
/// surface.
#[derive(Clone)]
pub struct WorkerHandle {
    name: &'static str,
    status: Arc<Mutex<String>>,
    last_run: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl WorkerHandle {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            status: Arc::new(Mutex::new(STATUS_STOPPED.to_string())),
            last_run: Arc::new(Mutex::new(None)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn status(&self) -> String {
        self.status.lock().clone()
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.lock()
    }

    /// A status beginning with `error` is how the health probe detects
    /// degradation.
    pub fn is_errored(&self) -> bool {
        self.status.lock().starts_with("error")
    }

    pub(crate) fn set_status(&self, status: impl Into<String>) {
        *self.status.lock() = status.into();
    }

    fn mark_run(&self) {
        *self.last_run.lock() = Some(Utc::now());
    }
}

/// Periodic task executor wrapping a [`Processor`].
pub struct Worker {
    handle: WorkerHandle,
    processor: Arc<dyn Processor>,
    interval: Duration,
    batch_size: usize,
    retry_count: u32,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// `shutdown` should be a child of the process root token so one cancel
    /// reaches every worker.
    pub fn new(
        name: &'static str,
        processor: Arc<dyn Processor>,
        interval: Duration,
        batch_size: usize,
        retry_count: u32,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            handle: WorkerHandle::new(name),
            processor,
            interval,
            batch_size,
            retry_count: retry_count.max(1),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Spawn the worker loop. The first tick runs immediately.
    pub fn start(&self) {
        self.handle.set_status(STATUS_RUNNING);
        let handle = self.handle.clone();
        let processor = Arc::clone(&self.processor);
        let interval = self.interval;
        let batch_size = self.batch_size;
        let retry_count = self.retry_count;
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            run_loop(handle, processor, interval, batch_size, retry_count, shutdown).await;
        });
        *self.task.lock() = Some(task);
        info!("worker {} started", self.handle.name());
    }

    /// Cancel the worker and wait for the in-flight tick to return.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!("worker {} task join failed: {err}", self.handle.name());
            }
        }
        self.handle.set_status(STATUS_STOPPED);
        info!("worker {} stopped", self.handle.name());
    }
}

async fn run_loop(
    handle: WorkerHandle,
    processor: Arc<dyn Processor>,
    interval: Duration,
    batch_size: usize,
    retry_count: u32,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                tick(&handle, processor.as_ref(), batch_size, retry_count, &shutdown).await;
            }
        }
    }
}

/// One tick: run the processor with in-tick retries and linear backoff.
async fn tick(
    handle: &WorkerHandle,
    processor: &dyn Processor,
    batch_size: usize,
    retry_count: u32,
    shutdown: &CancellationToken,
) {
    for attempt in 0..retry_count {
        let result = processor.process(shutdown, batch_size).await;
        handle.mark_run();
        match result {
            Ok(()) => {
                // A tick that succeeds clears any earlier error status so the
                // health probe reflects recovery.
                handle.set_status(STATUS_RUNNING);
                return;
            }
            Err(err) => {
                warn!(
                    "worker {} error (attempt {}/{}): {err:#}",
                    handle.name(),
                    attempt + 1,
                    retry_count
                );
                if attempt + 1 == retry_count {
                    handle.set_status(format!("error: {err:#}"));
                    return;
                }
                let backoff = Duration::from_secs(u64::from(attempt) + 1);
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailNTimes {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Processor for FailNTimes {
        async fn process(
            &self,
            _shutdown: &CancellationToken,
            _batch_size: usize,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("simulated failure");
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_runs_immediately() {
        let processor = Arc::new(FailNTimes {
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        });
        let worker = Worker::new(
            "test",
            processor.clone(),
            Duration::from_secs(3600),
            10,
            3,
            CancellationToken::new(),
        );
        worker.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(worker.handle().status(), STATUS_RUNNING);
        assert!(worker.handle().last_run().is_some());
        worker.stop().await;
        assert_eq!(worker.handle().status(), STATUS_STOPPED);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_set_error_status_without_stopping() {
        let processor = Arc::new(FailNTimes {
            failures: AtomicU32::new(u32::MAX),
            calls: AtomicU32::new(0),
        });
        let worker = Worker::new(
            "test",
            processor.clone(),
            Duration::from_secs(3600),
            10,
            3,
            CancellationToken::new(),
        );
        worker.start();
        // Backoffs between the three attempts are 1s and 2s.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
        let status = worker.handle().status();
        assert!(status.starts_with("error: "), "status was {status}");
        assert!(worker.handle().is_errored());
        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn successful_tick_clears_error_status() {
        let processor = Arc::new(FailNTimes {
            failures: AtomicU32::new(3),
            calls: AtomicU32::new(0),
        });
        let worker = Worker::new(
            "test",
            processor.clone(),
            Duration::from_secs(60),
            10,
            3,
            CancellationToken::new(),
        );
        worker.start();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(worker.handle().is_errored());
        // Next scheduled tick succeeds and resets the status.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(worker.handle().status(), STATUS_RUNNING);
        worker.stop().await;
    }
}
