//! Per-service resolution context bound to the invoking worker thread.
//!
//! Each service may carry its own `ServiceLoader` (type-name bindings private
//! to that service). While a call runs, the service's loader is the thread's
//! current loader; `LoaderGuard` restores the previous one afterwards, also
//! when the call unwinds.

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

thread_local! {
    static CURRENT: RefCell<Option<Arc<ServiceLoader>>> = const { RefCell::new(None) };
}

/// Type-name bindings private to one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLoader {
    service: String,
    bindings: HashMap<String, String>,
}

impl ServiceLoader {
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            bindings: HashMap::new(),
        }
    }

    /// Bind a declared type name to the implementation this service uses.
    #[must_use]
    pub fn with_binding(mut self, type_name: impl Into<String>, implementation: impl Into<String>) -> Self {
        self.bindings.insert(type_name.into(), implementation.into());
        self
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn resolve_type(&self, type_name: &str) -> Option<&str> {
        self.bindings.get(type_name).map(String::as_str)
    }
}

/// The loader bound to the calling thread, if any.
#[must_use]
pub fn current() -> Option<Arc<ServiceLoader>> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Resolve a type name through the calling thread's current loader.
#[must_use]
pub fn resolve_type(type_name: &str) -> Option<String> {
    CURRENT.with(|slot| {
        slot.borrow()
            .as_ref()
            .and_then(|loader| loader.resolve_type(type_name).map(str::to_owned))
    })
}

/// Restores the thread's previous loader on drop. Not `Send`: it must be
/// dropped on the thread that created it.
#[must_use = "the previous loader is restored as soon as the guard is dropped"]
pub struct LoaderGuard {
    previous: Option<Arc<ServiceLoader>>,
    _thread_bound: PhantomData<*const ()>,
}

impl LoaderGuard {
    /// Make `loader` the thread's current loader until the guard drops.
    /// `None` clears the binding for the duration.
    pub fn install(loader: Option<Arc<ServiceLoader>>) -> Self {
        let previous = CURRENT.with(|slot| slot.replace(loader));
        Self {
            previous,
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for LoaderGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // The slot is gone only during thread teardown; nothing to restore then.
        let _ = CURRENT.try_with(|slot| *slot.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};

    use super::*;

    fn is_current(expected: Option<&Arc<ServiceLoader>>) -> bool {
        match (current(), expected) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(&a, b),
            _ => false,
        }
    }

    #[test]
    fn guard_installs_and_restores() {
        let outer = Arc::new(ServiceLoader::new("framework"));
        let inner = Arc::new(ServiceLoader::new("Greeter").with_binding("Greeting", "greeter::Hello"));

        let _outer_guard = LoaderGuard::install(Some(Arc::clone(&outer)));
        {
            let _inner_guard = LoaderGuard::install(Some(Arc::clone(&inner)));
            assert!(is_current(Some(&inner)));
            assert_eq!(resolve_type("Greeting").as_deref(), Some("greeter::Hello"));
        }
        assert!(is_current(Some(&outer)));
        assert_eq!(resolve_type("Greeting"), None);
    }

    #[test]
    fn restores_after_panic() {
        let outer = Arc::new(ServiceLoader::new("framework"));
        let _outer_guard = LoaderGuard::install(Some(Arc::clone(&outer)));

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = LoaderGuard::install(Some(Arc::new(ServiceLoader::new("Greeter"))));
            panic!("business failure");
        }));

        assert!(result.is_err());
        assert!(is_current(Some(&outer)));
    }

    #[test]
    fn installing_none_clears_then_restores() {
        let outer = Arc::new(ServiceLoader::new("framework"));
        let _outer_guard = LoaderGuard::install(Some(Arc::clone(&outer)));
        {
            let _guard = LoaderGuard::install(None);
            assert!(is_current(None));
        }
        assert!(is_current(Some(&outer)));
    }

    #[test]
    fn binding_is_thread_local() {
        let _guard = LoaderGuard::install(Some(Arc::new(ServiceLoader::new("Greeter"))));
        let seen_elsewhere = std::thread::spawn(|| current().is_some()).join().unwrap();
        assert!(!seen_elsewhere);
    }
}
