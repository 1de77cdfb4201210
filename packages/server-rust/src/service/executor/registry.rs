use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use super::{Executor, PoolConfig, WorkerPool};

// ---------------------------------------------------------------------------
// ServicePool
// ---------------------------------------------------------------------------

/// A custom worker pool dedicated to one service.
///
/// Registered by configuration before or after server start; its executor is
/// only exposed once `start()` has succeeded.
pub struct ServicePool {
    service: String,
    config: PoolConfig,
    pool: RwLock<Option<Arc<WorkerPool>>>,
}

impl ServicePool {
    #[must_use]
    pub fn new(service: impl Into<String>, config: PoolConfig) -> Self {
        Self {
            service: service.into(),
            config,
            pool: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Start the pool's threads. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker threads cannot be spawned.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut slot = self.pool.write();
        if slot.is_none() {
            *slot = Some(Arc::new(WorkerPool::start(&self.config)?));
        }
        Ok(())
    }

    /// The running executor, or `None` if the pool has not been started.
    #[must_use]
    pub fn executor(&self) -> Option<Arc<dyn Executor>> {
        self.pool
            .read()
            .as_ref()
            .map(|pool| Arc::clone(pool) as Arc<dyn Executor>)
    }

    /// Stop the pool without joining its threads. Jobs already queued still
    /// run. It may be started again later.
    pub fn close(&self) {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close();
        }
    }

    /// Stop the pool and join its threads. It may be started again later.
    pub fn shutdown(&self) {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.shutdown();
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutorRegistry
// ---------------------------------------------------------------------------

/// Service identifier -> custom worker pool.
///
/// Read on every request by the executor selector, written rarely by
/// configuration. Lookups never fail; an unknown service yields `None`.
#[derive(Default)]
pub struct ExecutorRegistry {
    pools: DashMap<String, Arc<ServicePool>>,
}

impl ExecutorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool for its service, replacing any previous one. The
    /// replaced pool is closed, not joined, so this never blocks on its
    /// running jobs.
    pub fn register(&self, pool: ServicePool) -> Arc<ServicePool> {
        let pool = Arc::new(pool);
        if let Some(previous) = self.pools.insert(pool.service().to_owned(), Arc::clone(&pool)) {
            previous.close();
        }
        pool
    }

    #[must_use]
    pub fn get(&self, service: &str) -> Option<Arc<ServicePool>> {
        self.pools.get(service).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, service: &str) -> Option<Arc<ServicePool>> {
        self.pools.remove(service).map(|(_, pool)| pool)
    }

    /// Whether any service has a custom pool. When false, selection is skipped.
    #[must_use]
    pub fn has_custom_pools(&self) -> bool {
        !self.pools.is_empty()
    }

    /// Start every registered pool.
    ///
    /// # Errors
    ///
    /// Returns the first pool start failure.
    pub fn start_all(&self) -> anyhow::Result<()> {
        for entry in &self.pools {
            entry.value().start()?;
        }
        Ok(())
    }

    pub fn shutdown_all(&self) {
        // Collect first so no shard lock is held while joining threads.
        let pools: Vec<_> = self.pools.iter().map(|e| Arc::clone(e.value())).collect();
        for pool in pools {
            pool.shutdown();
        }
    }
}
