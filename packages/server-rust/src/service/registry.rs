use std::sync::Arc;

use dashmap::DashMap;

use super::invoker::Invoker;

/// Service identifier -> invoker.
///
/// Populated by provider registration, read by the dispatch pipeline on every
/// request. Safe under concurrent reads and writes; lookups never fail.
#[derive(Default)]
pub struct ServiceRegistry {
    invokers: DashMap<String, Arc<Invoker>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invoker, returning the one it replaced.
    pub fn register(&self, service: impl Into<String>, invoker: Invoker) -> Option<Arc<Invoker>> {
        self.invokers.insert(service.into(), Arc::new(invoker))
    }

    pub fn unregister(&self, service: &str) -> Option<Arc<Invoker>> {
        self.invokers.remove(service).map(|(_, invoker)| invoker)
    }

    #[must_use]
    pub fn find_invoker(&self, service: &str) -> Option<Arc<Invoker>> {
        self.invokers.get(service).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }

    /// Registered service identifiers, in no particular order.
    #[must_use]
    pub fn services(&self) -> Vec<String> {
        self.invokers.iter().map(|entry| entry.key().clone()).collect()
    }
}
