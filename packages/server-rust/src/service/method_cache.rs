use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use quiver_core::MethodDescriptor;

use super::loader::ServiceLoader;

#[derive(Default)]
struct ServiceEntry {
    loader: Option<Arc<ServiceLoader>>,
    /// Method name -> overloads, distinguished by argument signatures.
    overloads: HashMap<String, Vec<Arc<MethodDescriptor>>>,
}

/// Overload-aware method lookup plus per-service loaders.
///
/// Populated when providers are registered; read on every request.
#[derive(Default)]
pub struct MethodCache {
    services: DashMap<String, ServiceEntry>,
}

impl MethodCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method, replacing an existing overload with the same signature.
    pub fn register_method(&self, method: MethodDescriptor) -> Arc<MethodDescriptor> {
        let method = Arc::new(method);
        let mut entry = self.services.entry(method.service.clone()).or_default();
        let overloads = entry.overloads.entry(method.name.clone()).or_default();
        overloads.retain(|existing| !existing.accepts(&method.arg_sigs));
        overloads.push(Arc::clone(&method));
        method
    }

    pub fn register_loader(&self, loader: ServiceLoader) -> Arc<ServiceLoader> {
        let loader = Arc::new(loader);
        self.services
            .entry(loader.service().to_owned())
            .or_default()
            .loader = Some(Arc::clone(&loader));
        loader
    }

    /// Resolve a method by exact name and argument signatures.
    #[must_use]
    pub fn resolve(
        &self,
        service: &str,
        method: &str,
        arg_sigs: &[String],
    ) -> Option<Arc<MethodDescriptor>> {
        let entry = self.services.get(service)?;
        entry
            .overloads
            .get(method)?
            .iter()
            .find(|candidate| candidate.accepts(arg_sigs))
            .cloned()
    }

    #[must_use]
    pub fn service_loader(&self, service: &str) -> Option<Arc<ServiceLoader>> {
        self.services.get(service)?.loader.clone()
    }

    /// Drop every method and the loader registered for `service`.
    pub fn invalidate(&self, service: &str) {
        self.services.remove(service);
    }
}
