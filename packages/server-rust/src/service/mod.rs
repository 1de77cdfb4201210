//! Request handling: from a decoded request to the one response it earns.
//!
//! 1. **Dispatch** (`router`): pick the processor and the thread or pool
//! 2. **Pipeline** (`processor`): admission, resolution, invocation, delivery
//! 3. **Lookup** (`registry`, `method_cache`, `loader`): invokers, overloads, loaders
//! 4. **Completion** (`completion`, `context`): single-fire responses, per-request state
//! 5. **Pools** (`executor`): worker threads and per-service pool selection
//! 6. **Events** (`events`): hooks for tracing and metrics

use std::any::Any;

pub mod completion;
pub mod config;
pub mod context;
pub mod events;
pub mod executor;
pub mod invoker;
pub mod loader;
pub mod method_cache;
pub mod processor;
pub mod registry;
pub mod router;

pub use completion::{CompletionError, CompletionHandle, OneshotSink, TimeoutDiscardSink};
pub use config::ServerConfig;
pub use context::{ContextScope, InvocationContext};
pub use events::{DispatchEvent, EventBus, EventSink, MetricsEventSink, TracingEventSink};
pub use invoker::{Invoker, ProviderConfig, ProviderInvoker};
pub use loader::{LoaderGuard, ServiceLoader};
pub use method_cache::MethodCache;
pub use processor::{Registries, RequestProcessor, ServerProcessor};
pub use registry::ServiceRegistry;
pub use router::{DispatchError, Dispatcher, InboundCall, Scheduled};

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic with non-string payload".to_owned()
    }
}
