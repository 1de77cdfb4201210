//! Fixed-size worker pool backed by OS threads.
//!
//! Business handlers may block for the whole call, so they run on dedicated
//! threads rather than async tasks. Jobs are fed through a bounded tokio mpsc
//! channel: `try_send` never blocks the caller, and workers park in
//! `blocking_recv` while idle.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context as _;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::{Executor, Job, RejectReason, Rejected};
use crate::service::panic_message;

/// Sizing for a `WorkerPool`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Thread name prefix; threads are named `<name>-<index>`.
    pub name: String,
    /// Number of worker threads.
    pub threads: usize,
    /// Jobs that may wait for a free worker before new ones are rejected.
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "quiver-biz".to_string(),
            threads: 20,
            queue_capacity: 256,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// A started pool of worker threads.
///
/// Dropping the pool closes its queue; workers finish queued jobs and exit.
/// `shutdown()` additionally joins them.
pub struct WorkerPool {
    name: String,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn the pool's threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to spawn a worker thread.
    pub fn start(config: &PoolConfig) -> anyhow::Result<Self> {
        // mpsc::channel panics on zero capacity.
        let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let active = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(config.threads);
        for index in 0..config.threads.max(1) {
            let rx = Arc::clone(&rx);
            let active = Arc::clone(&active);
            let pool = config.name.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{index}", config.name))
                .spawn(move || run_worker(&rx, &active, &pool))
                .with_context(|| format!("spawning worker {index} of pool {}", config.name))?;
            workers.push(handle);
        }

        tracing::debug!(
            pool = %config.name,
            threads = workers.len(),
            queue_capacity = config.queue_capacity,
            "worker pool started"
        );

        Ok(Self {
            name: config.name.clone(),
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            active,
        })
    }

    /// Workers currently running a job.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Jobs waiting in the queue.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.tx
            .lock()
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Stop accepting jobs without waiting. Queued jobs still run; the
    /// workers exit on their own once the queue is empty.
    pub fn close(&self) {
        self.tx.lock().take();
        self.workers.lock().clear();
    }

    /// Stop accepting jobs, let queued jobs finish, and join the workers.
    /// Blocks the calling thread; from async code prefer `close()` or
    /// `spawn_blocking`.
    ///
    /// Must not be called from one of this pool's own workers; such a call
    /// closes the queue but skips joining.
    pub fn shutdown(&self) {
        self.tx.lock().take();

        let current = thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!(pool = %self.name, "worker thread exited abnormally");
            }
        }
    }
}

impl Executor for WorkerPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, job: Job) -> Result<(), Rejected> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(Rejected {
                job,
                reason: RejectReason::ShutDown,
            });
        };
        tx.try_send(job).map_err(|err| match err {
            TrySendError::Full(job) => Rejected {
                job,
                reason: RejectReason::Saturated,
            },
            TrySendError::Closed(job) => Rejected {
                job,
                reason: RejectReason::ShutDown,
            },
        })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx.lock().take();
    }
}

fn run_worker(rx: &Mutex<mpsc::Receiver<Job>>, active: &AtomicUsize, pool: &str) {
    loop {
        // Only one idle worker waits on the channel at a time; the rest wait
        // on the lock.
        let next = rx.lock().blocking_recv();
        let Some(job) = next else {
            break;
        };

        active.fetch_add(1, Ordering::AcqRel);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            tracing::error!(pool, panic = %panic_message(&*payload), "job panicked on worker");
        }
        active.fetch_sub(1, Ordering::AcqRel);
    }
}
