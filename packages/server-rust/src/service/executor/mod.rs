//! Worker pools and per-request executor selection.
//!
//! - [`pool`]: fixed-size OS thread pool with a bounded queue
//! - [`registry`]: per-service custom pools
//! - [`selector`]: picks a pool for a request from its header metadata

pub mod pool;
pub mod registry;
pub mod selector;

use std::fmt;

pub use pool::{PoolConfig, WorkerPool};
pub use registry::{ExecutorRegistry, ServicePool};
pub use selector::{ExecutorSelector, ServicePoolSelector};

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs jobs, typically on a pool of worker threads.
pub trait Executor: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Queue a job. Never blocks; a full or stopped executor hands the job back.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` carrying the job when it cannot be accepted.
    fn execute(&self, job: Job) -> Result<(), Rejected>;
}

/// Why an executor refused a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Saturated,
    ShutDown,
}

/// A job the executor refused, returned to the caller.
pub struct Rejected {
    pub job: Job,
    pub reason: RejectReason,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// Runs every job on the calling thread. Never rejects.
#[derive(Debug, Clone)]
pub struct InlineExecutor {
    name: String,
}

impl InlineExecutor {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Executor for InlineExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, job: Job) -> Result<(), Rejected> {
        job();
        Ok(())
    }
}
