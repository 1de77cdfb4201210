//! Server assembly with deferred startup.
//!
//! `new()` allocates the registries, the business pool and the pipeline;
//! providers register before or after `start()`; `stop()` refuses new work,
//! drains in-flight requests and joins the pools.

use std::sync::Arc;

use anyhow::{bail, Context as _};
use quiver_core::MethodDescriptor;
use tracing::{info, warn};

use crate::network::{HealthState, ServerLifecycle};
use crate::service::executor::{PoolConfig, ServicePool, WorkerPool};
use crate::service::{
    Dispatcher, EventBus, Invoker, ProviderConfig, Registries, ServerConfig, ServerProcessor,
    ServiceLoader,
};
use crate::traits::ServiceHandler;

/// An RPC server without a transport: transports feed it through
/// [`RpcServer::dispatcher`].
pub struct RpcServer {
    config: Arc<ServerConfig>,
    lifecycle: Arc<ServerLifecycle>,
    registries: Registries,
    biz_pool: Arc<WorkerPool>,
    events: EventBus,
    processor: Arc<ServerProcessor>,
}

impl RpcServer {
    /// Allocates shared state and spawns the business worker pool. The
    /// server refuses requests until `start()`.
    ///
    /// # Errors
    ///
    /// Returns an error if the business pool's threads cannot be spawned.
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let lifecycle = Arc::new(ServerLifecycle::new());
        let registries = Registries::default();
        let biz_pool = Arc::new(
            WorkerPool::start(&config.biz_pool).context("failed to start business worker pool")?,
        );
        let events = EventBus::new();
        let processor = Arc::new(ServerProcessor::new(
            Arc::clone(&config),
            Arc::clone(&lifecycle),
            registries.clone(),
            Arc::clone(&biz_pool) as _,
            events.clone(),
        ));

        Ok(Self {
            config,
            lifecycle,
            registries,
            biz_pool,
            events,
            processor,
        })
    }

    /// Starts the custom service pools and begins accepting requests.
    /// Calling it on a running server is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the server was already stopped or a service pool
    /// fails to start.
    pub fn start(&self) -> anyhow::Result<()> {
        match self.lifecycle.health_state() {
            HealthState::Ready => return Ok(()),
            HealthState::Draining | HealthState::Stopped => bail!("server {} was stopped", self.config.address()),
            HealthState::Starting => {}
        }
        self.registries.pools.start_all()?;
        self.lifecycle.set_ready();
        info!(address = %self.config.address(), services = self.registries.services.len(), "rpc server started");
        Ok(())
    }

    /// Refuses new requests, waits up to the configured drain timeout for
    /// in-flight ones, then joins every worker pool.
    ///
    /// Returns `false` if requests were still in flight at the deadline.
    pub async fn stop(&self) -> bool {
        self.lifecycle.trigger_shutdown();
        let drained = self.lifecycle.wait_for_drain(self.config.drain_timeout()).await;
        if !drained {
            warn!(in_flight = self.lifecycle.in_flight_count(), "drain timed out, stopping pools anyway");
        }

        let pools = Arc::clone(&self.registries.pools);
        let biz_pool = Arc::clone(&self.biz_pool);
        let joined = tokio::task::spawn_blocking(move || {
            pools.shutdown_all();
            biz_pool.shutdown();
        })
        .await;
        if let Err(err) = joined {
            warn!(error = %err, "worker pool shutdown failed");
        }

        info!(address = %self.config.address(), drained, "rpc server stopped");
        drained
    }

    /// Registers a provider and its callable methods, replacing any previous
    /// provider for the same service. Returns the replaced invoker.
    pub fn register_provider(
        &self,
        config: ProviderConfig,
        handler: Arc<dyn ServiceHandler>,
        methods: impl IntoIterator<Item = MethodDescriptor>,
    ) -> Option<Arc<Invoker>> {
        let service = config.service.clone();
        let mut count = 0_usize;
        for method in methods {
            if method.service != service {
                warn!(%service, method_service = %method.service, method = %method.name, "method belongs to another service, skipped");
                continue;
            }
            self.registries.methods.register_method(method);
            count += 1;
        }
        info!(%service, methods = count, "provider registered");
        self.registries
            .services
            .register(service, Invoker::provider(config, handler))
    }

    /// Registers a non-provider invoker (a proxy, a generic service).
    pub fn register_invoker(
        &self,
        service: impl Into<String>,
        invoker: Invoker,
        methods: impl IntoIterator<Item = MethodDescriptor>,
    ) -> Option<Arc<Invoker>> {
        for method in methods {
            self.registries.methods.register_method(method);
        }
        self.registries.services.register(service, invoker)
    }

    /// Binds a loader to its service; invocations of that service run with
    /// it installed on the worker thread.
    pub fn register_loader(&self, loader: ServiceLoader) -> Arc<ServiceLoader> {
        self.registries.methods.register_loader(loader)
    }

    /// Gives a service its own worker pool. Started immediately if the
    /// server is running, otherwise by `start()`. A pool it replaces is
    /// closed without joining its threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is running and the pool fails to start.
    pub fn register_service_pool(&self, service: impl Into<String>, config: PoolConfig) -> anyhow::Result<()> {
        let pool = self.registries.pools.register(ServicePool::new(service, config));
        if self.lifecycle.is_accepting() {
            pool.start()
                .with_context(|| format!("failed to start pool for service {}", pool.service()))?;
        }
        Ok(())
    }

    /// Removes a service: its invoker, its methods and loader, and its pool.
    /// The pool is closed without joining, so this is safe to call from
    /// async code.
    pub fn unregister(&self, service: &str) -> Option<Arc<Invoker>> {
        let invoker = self.registries.services.unregister(service);
        self.registries.methods.invalidate(service);
        if let Some(pool) = self.registries.pools.remove(service) {
            pool.close();
        }
        if invoker.is_some() {
            info!(%service, "provider unregistered");
        }
        invoker
    }

    /// A dispatcher routing requests to this server's pipeline.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(Arc::clone(&self.processor) as _);
        dispatcher
    }

    #[must_use]
    pub fn processor(&self) -> Arc<ServerProcessor> {
        Arc::clone(&self.processor)
    }

    /// Subscribe sinks here to observe pipeline events.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    #[must_use]
    pub fn lifecycle(&self) -> Arc<ServerLifecycle> {
        Arc::clone(&self.lifecycle)
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Whether the server currently accepts requests.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.lifecycle.is_accepting()
    }
}
