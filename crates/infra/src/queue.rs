//! Bounded-concurrency work queue draining an [`EventSource`].
//!
//! ## Behavior
//!
//! - At most `max_parallel` handler invocations hold a slot at any time
//! - A slot is acquired *before* the next item is pulled, so the queue never holds
//!   an item it cannot start (backpressure lands on the source)
//! - Items start in source order; completion order is unspecified
//! - Every invocation runs as its own task, supervised with `task_timeout`. On
//!   timeout the slot is released and the invocation is left running (detached),
//!   never aborted
//! - Handler errors and source errors are logged and counted; nothing stops the loop
//!   except the source closing or [`QueueHandle::stop`]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use haulage_events::EventSource;

use crate::handlers::HandlerError;

/// Work queue configuration.
#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    /// Name for logging
    pub name: String,
    /// Maximum concurrently running handler invocations
    pub max_parallel: usize,
    /// Per-invocation supervision deadline
    pub task_timeout: Duration,
    /// How long `stop()` waits for dispatched invocations
    pub shutdown_grace: Duration,
    /// Delay before polling the source again after a source error
    pub source_retry_delay: Duration,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            name: "work-queue".to_string(),
            max_parallel: 4,
            task_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            source_retry_delay: Duration::from_secs(1),
        }
    }
}

impl WorkQueueConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_source_retry_delay(mut self, delay: Duration) -> Self {
        self.source_retry_delay = delay;
        self
    }
}

/// Processes one work item.
#[async_trait]
pub trait TaskHandler<T>: Send + Sync + 'static {
    async fn handle(&self, item: T) -> Result<(), HandlerError>;

    /// Identity of the item for logs (e.g. `loads/<id>@<version>`).
    fn describe(&self, item: &T) -> String;
}

/// Queue runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub source_errors: u64,
    /// Invocations currently holding a slot.
    pub running: usize,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    source_errors: AtomicU64,
    running: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
        }
    }
}

/// Handle to control a running queue.
#[derive(Debug)]
pub struct QueueHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    slots: Arc<Semaphore>,
    max_parallel: u32,
    shutdown_grace: Duration,
    counters: Arc<Counters>,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }

    /// Stop pulling new items, then wait up to `shutdown_grace` for dispatched
    /// invocations to release their slots. Returns the final statistics.
    pub async fn stop(mut self) -> QueueStats {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(queue = %self.name, error = %e, "dispatch loop panicked");
            }
        }

        let drained = tokio::time::timeout(
            self.shutdown_grace,
            self.slots.acquire_many(self.max_parallel),
        )
        .await;

        let stats = self.counters.snapshot();
        match drained {
            Ok(_) => info!(queue = %self.name, ?stats, "work queue stopped"),
            Err(_) => warn!(
                queue = %self.name,
                running = stats.running,
                "shutdown grace elapsed with invocations still running"
            ),
        }
        stats
    }
}

/// Bounded-concurrency dispatcher.
#[derive(Debug)]
pub struct WorkQueue;

impl WorkQueue {
    /// Spawn the dispatch loop on the current tokio runtime.
    pub fn start<T, S, H>(config: WorkQueueConfig, source: S, handler: H) -> QueueHandle
    where
        T: Send + 'static,
        S: EventSource<T>,
        H: TaskHandler<T>,
    {
        let max_parallel = u32::try_from(config.max_parallel.max(1)).unwrap_or(u32::MAX);
        let slots = Arc::new(Semaphore::new(max_parallel as usize));
        let counters = Arc::new(Counters::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let name = config.name.clone();
        let shutdown_grace = config.shutdown_grace;
        let join = tokio::spawn(dispatch_loop(
            config,
            source,
            Arc::new(handler),
            slots.clone(),
            counters.clone(),
            shutdown_rx,
        ));

        QueueHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
            slots,
            max_parallel,
            shutdown_grace,
            counters,
        }
    }
}

async fn dispatch_loop<T, S, H>(
    config: WorkQueueConfig,
    mut source: S,
    handler: Arc<H>,
    slots: Arc<Semaphore>,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) where
    T: Send + 'static,
    S: EventSource<T>,
    H: TaskHandler<T>,
{
    info!(queue = %config.name, max_parallel = config.max_parallel, "work queue started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = source.next() => next,
        };

        let item = match next {
            Ok(Some(item)) => item,
            Ok(None) => {
                info!(queue = %config.name, "source closed");
                break;
            }
            Err(e) => {
                drop(permit);
                counters.source_errors.fetch_add(1, Ordering::Relaxed);
                warn!(queue = %config.name, error = %e, "source error; retrying");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(config.source_retry_delay) => continue,
                }
            }
        };

        let label = handler.describe(&item);
        counters.dispatched.fetch_add(1, Ordering::Relaxed);
        counters.running.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %config.name, item = %label, "dispatching");

        let invocation = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle(item).await })
        };

        let queue = config.name.clone();
        let task_timeout = config.task_timeout;
        let counters = counters.clone();
        tokio::spawn(async move {
            let _slot = permit;
            match tokio::time::timeout(task_timeout, invocation).await {
                Ok(Ok(Ok(()))) => {
                    counters.succeeded.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Ok(Err(e))) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(queue = %queue, item = %label, error = %e, "handler failed");
                }
                Ok(Err(join_err)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(queue = %queue, item = %label, error = %join_err, "handler panicked");
                }
                Err(_) => {
                    counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    error!(
                        queue = %queue,
                        item = %label,
                        timeout_ms = u64::try_from(task_timeout.as_millis()).unwrap_or(u64::MAX),
                        "handler timed out; slot released, invocation left running"
                    );
                }
            }
            counters.running.fetch_sub(1, Ordering::Relaxed);
        });
    }

    info!(queue = %config.name, "dispatch loop exited");
}
