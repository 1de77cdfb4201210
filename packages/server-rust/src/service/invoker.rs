use std::fmt;
use std::sync::Arc;

use quiver_core::{Request, Response, RpcError};

use super::context::InvocationContext;
use crate::traits::{Invoke, ServiceHandler};

/// Registration-time configuration of a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Unique service identifier requests are routed by.
    pub service: String,
    /// Owning application, used for log attribution.
    pub app_name: Option<String>,
}

impl ProviderConfig {
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            app_name: None,
        }
    }

    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }
}

/// A provider: business logic plus the configuration it was registered with.
#[derive(Clone)]
pub struct ProviderInvoker {
    config: Arc<ProviderConfig>,
    handler: Arc<dyn ServiceHandler>,
}

impl ProviderInvoker {
    #[must_use]
    pub fn new(config: ProviderConfig, handler: Arc<dyn ServiceHandler>) -> Self {
        Self {
            config: Arc::new(config),
            handler,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn invoke(&self, request: &Request, ctx: &mut InvocationContext) -> Result<Response, RpcError> {
        let method = request.method().ok_or_else(|| {
            RpcError::method_not_found(request.service(), request.method_name())
        })?;
        let value = self.handler.handle(method, request.args(), ctx)?;
        Ok(Response::Payload(value))
    }
}

/// Everything the pipeline can dispatch a call to.
#[derive(Clone)]
pub enum Invoker {
    Provider(ProviderInvoker),
    Direct(Arc<dyn Invoke>),
}

impl Invoker {
    #[must_use]
    pub fn provider(config: ProviderConfig, handler: Arc<dyn ServiceHandler>) -> Self {
        Self::Provider(ProviderInvoker::new(config, handler))
    }

    /// Run the call. Business failures come back as `Err`; panics propagate
    /// to the caller, which is expected to contain them.
    ///
    /// # Errors
    ///
    /// Returns the invocation failure reported by the provider or invoker.
    pub fn invoke(&self, request: &Request, ctx: &mut InvocationContext) -> Result<Response, RpcError> {
        match self {
            Self::Provider(provider) => provider.invoke(request, ctx),
            Self::Direct(invoke) => invoke.invoke(request, ctx),
        }
    }

    #[must_use]
    pub fn provider_config(&self) -> Option<&ProviderConfig> {
        match self {
            Self::Provider(provider) => Some(provider.config()),
            Self::Direct(_) => None,
        }
    }
}

impl fmt::Debug for Invoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provider(provider) => f.debug_tuple("Provider").field(provider.config()).finish(),
            Self::Direct(_) => f.write_str("Direct(..)"),
        }
    }
}
