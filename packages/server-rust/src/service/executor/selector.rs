use std::sync::Arc;

use quiver_core::{Request, RequestHeader};

use super::{Executor, ExecutorRegistry};

/// Chooses the executor that will run a request, before its body is handled.
pub trait ExecutorSelector: Send + Sync {
    /// Never fails: anything unexpected resolves to the default executor.
    fn select(&self, request_type: &str, header: Option<&RequestHeader>) -> Arc<dyn Executor>;
}

/// Routes requests to their service's custom pool when one is running.
pub struct ServicePoolSelector {
    registry: Arc<ExecutorRegistry>,
    default: Arc<dyn Executor>,
}

impl ServicePoolSelector {
    #[must_use]
    pub fn new(registry: Arc<ExecutorRegistry>, default: Arc<dyn Executor>) -> Self {
        Self { registry, default }
    }

    fn custom_executor(&self, header: &RequestHeader) -> Option<Arc<dyn Executor>> {
        let service = match header.service_id() {
            Ok(service) => service?,
            Err(err) => {
                tracing::warn!(error = %err, "cannot read target service from request header, using default pool");
                return None;
            }
        };
        self.registry.get(&service)?.executor()
    }
}

impl ExecutorSelector for ServicePoolSelector {
    fn select(&self, request_type: &str, header: Option<&RequestHeader>) -> Arc<dyn Executor> {
        if request_type == Request::TYPE_NAME {
            if let Some(executor) = header.and_then(|h| self.custom_executor(h)) {
                return executor;
            }
        }
        Arc::clone(&self.default)
    }
}
