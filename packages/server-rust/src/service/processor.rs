//! The dispatch pipeline: decoded request in, at most one response out.
//!
//! For each request, on the worker that runs it:
//!
//! 1. **Context**: count the request in-flight, record transport details
//! 2. **Admission**: refuse when stopped (unless admitted before a drain), drop
//!    silently when the client expired
//! 3. **Resolution**: invoker by service, method by name + argument signatures
//! 4. **Invocation**: under the service's loader, with failures contained
//! 5. **Delivery**: fire the completion handle unless business logic deferred it
//! 6. **Teardown**: clear the context and release the in-flight count

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use quiver_core::{Request, Response, RpcError};
use tracing::info_span;

use super::completion::CompletionHandle;
use super::config::ServerConfig;
use super::context::{ContextScope, InvocationContext};
use super::events::{DispatchEvent, EventBus};
use super::executor::{Executor, ExecutorRegistry, ExecutorSelector, ServicePoolSelector};
use super::invoker::Invoker;
use super::loader::LoaderGuard;
use super::method_cache::MethodCache;
use super::panic_message;
use super::registry::ServiceRegistry;
use crate::network::{InFlightGuard, ServerLifecycle};
use crate::traits::TransportContext;

// ---------------------------------------------------------------------------
// RequestProcessor
// ---------------------------------------------------------------------------

/// What a transport needs from a request-handling pipeline.
pub trait RequestProcessor: Send + Sync + 'static {
    /// Request type this processor handles, for transports that multiplex.
    fn interest(&self) -> &'static str;

    /// The default worker pool.
    fn executor(&self) -> Arc<dyn Executor>;

    /// Per-request pool selection, or `None` when every request uses `executor()`.
    fn executor_selector(&self) -> Option<Arc<dyn ExecutorSelector>>;

    /// Whether the transport may drop a computed response for an expired client.
    fn timeout_discard(&self) -> bool;

    /// Whether the transport may run `handle_request` on its I/O thread.
    fn process_in_io_thread(&self) -> bool;

    /// Count a request in before it waits for a worker, so a graceful stop
    /// waits for it too. `None` means the request is not admitted and will
    /// be judged when it runs.
    fn admit(&self) -> Option<InFlightGuard> {
        None
    }

    /// Handle one request to completion. Never panics and never returns an
    /// error; every outcome is answered through `completion` or logged.
    fn handle_request(
        &self,
        transport: &dyn TransportContext,
        completion: CompletionHandle,
        request: Request,
    );
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

/// Read-mostly lookup tables the pipeline consults.
#[derive(Clone, Default)]
pub struct Registries {
    pub services: Arc<ServiceRegistry>,
    pub methods: Arc<MethodCache>,
    pub pools: Arc<ExecutorRegistry>,
}

// ---------------------------------------------------------------------------
// ServerProcessor
// ---------------------------------------------------------------------------

/// Outcome of the admission/resolution/invocation stages.
struct Handled {
    /// `None` means nothing is sent back.
    response: Option<Response>,
    /// Diagnostic error for logs and events; may accompany a payload.
    error: Option<RpcError>,
}

impl Handled {
    fn answered(response: Response) -> Self {
        Self {
            response: Some(response),
            error: None,
        }
    }

    fn failed(error: RpcError) -> Self {
        Self {
            response: Some(Response::from(&error)),
            error: Some(error),
        }
    }

    fn discarded(error: RpcError) -> Self {
        Self {
            response: None,
            error: Some(error),
        }
    }
}

/// The server's `RequestProcessor` for `quiver_core::Request`.
pub struct ServerProcessor {
    config: Arc<ServerConfig>,
    lifecycle: Arc<ServerLifecycle>,
    registries: Registries,
    default_executor: Arc<dyn Executor>,
    selector: Arc<ServicePoolSelector>,
    events: EventBus,
}

impl ServerProcessor {
    #[must_use]
    pub fn new(
        config: Arc<ServerConfig>,
        lifecycle: Arc<ServerLifecycle>,
        registries: Registries,
        default_executor: Arc<dyn Executor>,
        events: EventBus,
    ) -> Self {
        let selector = Arc::new(ServicePoolSelector::new(
            Arc::clone(&registries.pools),
            Arc::clone(&default_executor),
        ));
        Self {
            config,
            lifecycle,
            registries,
            default_executor,
            selector,
            events,
        }
    }

    /// Requests admitted for a worker or currently being handled.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.lifecycle.in_flight_count()
    }

    fn process(
        &self,
        transport: &dyn TransportContext,
        request: &mut Request,
        ctx: &mut InvocationContext,
        app_name: &mut Option<String>,
    ) -> Handled {
        let service = request.service().to_owned();

        if !self.lifecycle.is_accepting() && !transport.is_admitted() {
            let err = RpcError::server_unavailable(&self.config.address());
            tracing::warn!(app = app_label(app_name.as_deref()), error = %err, "request refused");
            return Handled::failed(err);
        }

        if transport.is_request_timeout() {
            let err = RpcError::discarded_request(&service, &remote_label(transport.remote_addr()));
            tracing::warn!(app = app_label(app_name.as_deref()), error = %err, "request discarded");
            return Handled::discarded(err);
        }

        let Some(invoker) = self.registries.services.find_invoker(&service) else {
            let err = RpcError::service_not_found(&service);
            tracing::error!(app = app_label(app_name.as_deref()), error = %err, "service lookup failed");
            return Handled::failed(err);
        };

        if let Some(owner) = invoker.provider_config().and_then(|c| c.app_name.clone()) {
            ctx.set_app_name(Some(owner.clone()));
            *app_name = Some(owner);
        }

        let Some(method) =
            self.registries
                .methods
                .resolve(&service, request.method_name(), request.arg_sigs())
        else {
            let err = RpcError::method_not_found(&service, request.method_name());
            tracing::error!(app = app_label(app_name.as_deref()), error = %err, "method lookup failed");
            return Handled::failed(err);
        };
        request.bind_method(method);

        let response = match self.invoke_isolated(&service, &invoker, request, ctx) {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(app = app_label(app_name.as_deref()), error = %err, "server processor error");
                return Handled::failed(err);
            }
        };

        // The client may have expired while business logic ran. The response
        // is still handed over; dropping it is the transport's call.
        if transport.is_request_timeout() {
            let err = RpcError::discarded_response(&service, &remote_label(transport.remote_addr()));
            tracing::warn!(app = app_label(app_name.as_deref()), error = %err, "response late");
            return Handled {
                response: Some(response),
                error: Some(err),
            };
        }

        Handled::answered(response)
    }

    /// Invoke with the service's loader bound to this thread, containing panics.
    fn invoke_isolated(
        &self,
        service: &str,
        invoker: &Invoker,
        request: &Request,
        ctx: &mut InvocationContext,
    ) -> Result<Response, RpcError> {
        let _loader = LoaderGuard::install(self.registries.methods.service_loader(service));

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| invoker.invoke(request, ctx)))
            .unwrap_or_else(|payload| Err(RpcError::undeclared(panic_message(&*payload))));

        self.events.publish(|| DispatchEvent::Invoked {
            service: service.to_owned(),
            method: request.method_name().to_owned(),
            elapsed: started.elapsed(),
            ok: result.is_ok(),
        });
        result
    }

    fn deliver(
        &self,
        completion: &CompletionHandle,
        request: &Request,
        response: Response,
        error: Option<RpcError>,
        app_name: Option<&str>,
    ) {
        let response_error = response.as_error().map(|desc| desc.kind);
        let sent = panic::catch_unwind(AssertUnwindSafe(|| completion.send(response)));

        self.events.publish(|| DispatchEvent::Sent {
            service: request.service().to_owned(),
            method: request.method_name().to_owned(),
            response_error,
            error,
        });

        match sent {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(app = app_label(app_name), error = %err, "response delivery failed");
            }
            Err(payload) => {
                tracing::error!(
                    app = app_label(app_name),
                    panic = %panic_message(&*payload),
                    "response sink panicked"
                );
            }
        }
    }
}

impl RequestProcessor for ServerProcessor {
    fn interest(&self) -> &'static str {
        Request::TYPE_NAME
    }

    fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.default_executor)
    }

    fn executor_selector(&self) -> Option<Arc<dyn ExecutorSelector>> {
        self.registries
            .pools
            .has_custom_pools()
            .then(|| Arc::clone(&self.selector) as Arc<dyn ExecutorSelector>)
    }

    fn timeout_discard(&self) -> bool {
        self.config.timeout_discard()
    }

    fn process_in_io_thread(&self) -> bool {
        self.config.process_in_io_thread()
    }

    fn admit(&self) -> Option<InFlightGuard> {
        self.lifecycle.admit()
    }

    fn handle_request(
        &self,
        transport: &dyn TransportContext,
        completion: CompletionHandle,
        mut request: Request,
    ) {
        let span = info_span!("rpc", service = %request.service(), method = %request.method_name());
        let _entered = span.enter();

        let mut app_name = request
            .target_app_name()
            .map(str::to_owned)
            .or_else(|| self.config.app_name.clone());
        let mut scope = ContextScope::enter(&self.lifecycle);
        let mut deferred = false;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let ctx = scope.context_mut();
            ctx.set_remote_addr(transport.remote_addr());
            ctx.set_app_name(app_name.clone());
            ctx.attach_completion(completion.clone());
            ctx.record_timing(transport.timing());

            self.events.publish(|| DispatchEvent::Received {
                service: request.service().to_owned(),
                method: request.method_name().to_owned(),
                remote: transport.remote_addr(),
            });

            let handled = panic::catch_unwind(AssertUnwindSafe(|| {
                self.process(transport, &mut request, ctx, &mut app_name)
            }))
            .unwrap_or_else(|payload| {
                let err = RpcError::undeclared(panic_message(&*payload));
                tracing::error!(app = app_label(app_name.as_deref()), error = %err, "server processor error");
                Handled::failed(err)
            });

            let Some(response) = handled.response else {
                return;
            };
            deferred = ctx.take_async_chain();
            if deferred {
                tracing::debug!("response deferred to business logic");
            } else {
                self.deliver(&completion, &request, response, handled.error, app_name.as_deref());
            }
        }));

        if let Err(payload) = outcome {
            tracing::error!(
                app = app_label(app_name.as_deref()),
                panic = %panic_message(&*payload),
                "request handling aborted"
            );
        }

        if !deferred {
            self.events.publish(|| DispatchEvent::EndHandle);
        }
        drop(scope);
    }
}

pub(super) fn app_label(app_name: Option<&str>) -> &str {
    app_name.unwrap_or("-")
}

fn remote_label(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| "unknown".to_owned(), |addr| addr.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use quiver_core::{MethodDescriptor, RpcErrorKind, Value};
    use tokio::sync::oneshot;

    use super::*;
    use crate::network::TimingMarks;
    use crate::service::events::EventSink;
    use crate::service::executor::{InlineExecutor, PoolConfig, ServicePool};
    use crate::service::invoker::ProviderConfig;
    use crate::service::loader::{self, ServiceLoader};
    use crate::traits::{ResponseSink, ServiceHandler};

    type HandlerFn =
        dyn Fn(&MethodDescriptor, &[Value], &mut InvocationContext) -> anyhow::Result<Value> + Send + Sync;

    struct FnHandler {
        calls: AtomicUsize,
        f: Box<HandlerFn>,
    }

    impl FnHandler {
        fn new(
            f: impl Fn(&MethodDescriptor, &[Value], &mut InvocationContext) -> anyhow::Result<Value>
                + Send
                + Sync
                + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                f: Box::new(f),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ServiceHandler for FnHandler {
        fn handle(
            &self,
            method: &MethodDescriptor,
            args: &[Value],
            ctx: &mut InvocationContext,
        ) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.f)(method, args, ctx)
        }
    }

    #[derive(Default)]
    struct StubTransport {
        expired: Arc<AtomicBool>,
        marks: TimingMarks,
    }

    impl TransportContext for StubTransport {
        fn remote_addr(&self) -> Option<SocketAddr> {
            Some("192.168.1.20:40000".parse().unwrap())
        }
        fn is_request_timeout(&self) -> bool {
            self.expired.load(Ordering::SeqCst)
        }
        fn timing(&self) -> TimingMarks {
            self.marks
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<DispatchEvent>>);

    impl EventSink for Recorder {
        fn on_event(&self, event: &DispatchEvent) {
            self.0.lock().push(event.clone());
        }
    }

    impl Recorder {
        fn sent(&self) -> Vec<DispatchEvent> {
            self.0
                .lock()
                .iter()
                .filter(|e| matches!(e, DispatchEvent::Sent { .. }))
                .cloned()
                .collect()
        }

        fn count(&self, pred: impl Fn(&DispatchEvent) -> bool) -> usize {
            self.0.lock().iter().filter(|e| pred(e)).count()
        }
    }

    struct Fixture {
        processor: ServerProcessor,
        lifecycle: Arc<ServerLifecycle>,
        registries: Registries,
        events: Arc<Recorder>,
    }

    impl Fixture {
        fn build(config: ServerConfig, ready: bool) -> Self {
            let lifecycle = Arc::new(ServerLifecycle::new());
            if ready {
                lifecycle.set_ready();
            }
            let registries = Registries::default();
            let bus = EventBus::new();
            let events = Arc::new(Recorder::default());
            bus.subscribe(events.clone());
            let processor = ServerProcessor::new(
                Arc::new(config),
                Arc::clone(&lifecycle),
                registries.clone(),
                Arc::new(InlineExecutor::new("default")),
                bus,
            );
            Self {
                processor,
                lifecycle,
                registries,
                events,
            }
        }

        fn new(config: ServerConfig) -> Self {
            Self::build(config, true)
        }

        fn ready() -> Self {
            Self::new(ServerConfig::default())
        }

        fn provide(&self, config: ProviderConfig, handler: Arc<FnHandler>, methods: &[(&str, &[&str])]) {
            for (name, sigs) in methods {
                self.registries.methods.register_method(MethodDescriptor::new(
                    config.service.clone(),
                    *name,
                    sigs.iter().copied(),
                ));
            }
            self.registries
                .services
                .register(config.service.clone(), Invoker::provider(config, handler));
        }

        fn greeter(&self) -> Arc<FnHandler> {
            let handler = FnHandler::new(|_m: &MethodDescriptor, args: &[Value], _ctx: &mut InvocationContext| {
                let name = args.first().and_then(Value::as_str).unwrap_or("stranger");
                Ok(Value::from(format!("hi {name}")))
            });
            self.provide(ProviderConfig::new("Greeter"), handler.clone(), &[("sayHi", &["Str"])]);
            handler
        }

        fn call_with(&self, transport: &StubTransport, request: Request) -> Option<Response> {
            let (completion, mut rx) = CompletionHandle::channel();
            self.processor.handle_request(transport, completion, request);
            rx.try_recv().ok()
        }

        fn call(&self, request: Request) -> Option<Response> {
            self.call_with(&StubTransport::default(), request)
        }
    }

    fn say_hi(name: &str) -> Request {
        Request::new("Greeter", "sayHi").with_arg("Str", name)
    }

    fn error_of(response: Option<Response>) -> quiver_core::ErrorDescriptor {
        response.expect("a response").as_error().expect("an error response").clone()
    }

    #[test]
    fn greeter_returns_declared_result() {
        let fx = Fixture::ready();
        let handler = fx.greeter();

        let response = fx.call(say_hi("bob")).unwrap();

        assert_eq!(response, Response::payload("hi bob"));
        assert_eq!(handler.calls(), 1);
        assert_eq!(
            fx.events.sent(),
            vec![DispatchEvent::Sent {
                service: "Greeter".into(),
                method: "sayHi".into(),
                response_error: None,
                error: None,
            }]
        );
        assert_eq!(fx.events.count(|e| matches!(e, DispatchEvent::EndHandle)), 1);
        assert_eq!(fx.lifecycle.in_flight_count(), 0);
    }

    #[test]
    fn events_follow_pipeline_order() {
        let fx = Fixture::ready();
        fx.greeter();
        fx.call(say_hi("bob"));

        let kinds: Vec<&str> = fx
            .events
            .0
            .lock()
            .iter()
            .map(|e| match e {
                DispatchEvent::Received { .. } => "received",
                DispatchEvent::Invoked { .. } => "invoked",
                DispatchEvent::Sent { .. } => "sent",
                DispatchEvent::EndHandle => "end",
            })
            .collect();
        assert_eq!(kinds, ["received", "invoked", "sent", "end"]);
    }

    #[test]
    fn unknown_service_is_not_found() {
        let fx = Fixture::ready();
        fx.greeter();

        let err = error_of(fx.call(Request::new("Ghost", "boo")));

        assert_eq!(err.kind, RpcErrorKind::NotFound);
        assert!(err.message.contains("Ghost"));
        assert_eq!(fx.events.count(|e| matches!(e, DispatchEvent::Invoked { .. })), 0);
        assert_eq!(fx.lifecycle.in_flight_count(), 0);
    }

    #[test]
    fn unknown_signature_is_not_found() {
        let fx = Fixture::ready();
        let handler = fx.greeter();

        let err = error_of(fx.call(Request::new("Greeter", "sayHi").with_arg("Int", 7)));
        assert_eq!(err.kind, RpcErrorKind::NotFound);
        assert!(err.message.contains("sayHi"));

        let err = error_of(fx.call(Request::new("Greeter", "sayBye").with_arg("Str", "bob")));
        assert_eq!(err.kind, RpcErrorKind::NotFound);
        assert!(err.message.contains("sayBye"));

        assert_eq!(handler.calls(), 0);
    }

    #[test]
    fn refuses_before_start_and_after_shutdown() {
        let starting = Fixture::build(ServerConfig::default(), false);
        let idle = starting.greeter();
        let err = error_of(starting.call(say_hi("bob")));
        assert_eq!(err.kind, RpcErrorKind::ServerUnavailable);
        assert!(err.message.contains("0.0.0.0:12200"));
        assert_eq!(idle.calls(), 0);

        let fx = Fixture::ready();
        let handler = fx.greeter();
        fx.lifecycle.trigger_shutdown();
        let err = error_of(fx.call(say_hi("bob")));
        assert_eq!(err.kind, RpcErrorKind::ServerUnavailable);
        assert_eq!(handler.calls(), 0);
        assert_eq!(fx.lifecycle.in_flight_count(), 0);
    }

    #[test]
    fn expired_request_is_dropped_silently() {
        let fx = Fixture::ready();
        let handler = fx.greeter();
        let transport = StubTransport::default();
        transport.expired.store(true, Ordering::SeqCst);

        let (completion, mut rx) = CompletionHandle::channel();
        fx.processor.handle_request(&transport, completion, say_hi("bob"));

        assert!(matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
        assert_eq!(handler.calls(), 0);
        assert!(fx.events.sent().is_empty());
        assert_eq!(fx.events.count(|e| matches!(e, DispatchEvent::EndHandle)), 1);
        assert_eq!(fx.lifecycle.in_flight_count(), 0);
    }

    #[test]
    fn late_response_is_still_delivered() {
        let fx = Fixture::ready();
        let transport = StubTransport::default();
        let expired = Arc::clone(&transport.expired);
        let handler = FnHandler::new(move |_m: &MethodDescriptor, _a: &[Value], _c: &mut InvocationContext| {
            expired.store(true, Ordering::SeqCst);
            Ok(Value::from("slow hello"))
        });
        fx.provide(ProviderConfig::new("Slow"), handler, &[("hello", &[])]);

        let response = fx.call_with(&transport, Request::new("Slow", "hello"));

        assert_eq!(response, Some(Response::payload("slow hello")));
        let sent = fx.events.sent();
        assert!(matches!(
            &sent[..],
            [DispatchEvent::Sent { response_error: None, error: Some(err), .. }]
                if err.kind == RpcErrorKind::ClientTimeout
        ));
    }

    #[test]
    fn handler_error_becomes_undeclared_error() {
        let fx = Fixture::ready();
        let handler = FnHandler::new(|_m: &MethodDescriptor, _a: &[Value], _c: &mut InvocationContext| {
            anyhow::bail!("database unreachable")
        });
        fx.provide(ProviderConfig::new("Broken"), handler, &[("run", &[])]);

        let err = error_of(fx.call(Request::new("Broken", "run")));
        assert_eq!(err.kind, RpcErrorKind::UndeclaredServerError);
        assert_eq!(err.message, "database unreachable");
    }

    #[test]
    fn handler_panic_is_contained() {
        let fx = Fixture::ready();
        let handler = FnHandler::new(|_m: &MethodDescriptor, _a: &[Value], _c: &mut InvocationContext| {
            panic!("index out of range")
        });
        fx.provide(ProviderConfig::new("Panicky"), handler, &[("run", &[])]);

        let err = error_of(fx.call(Request::new("Panicky", "run")));
        assert_eq!(err.kind, RpcErrorKind::UndeclaredServerError);
        assert_eq!(err.message, "index out of range");
        assert_eq!(fx.lifecycle.in_flight_count(), 0);
    }

    #[test]
    fn invocation_runs_under_service_loader() {
        let fx = Fixture::ready();
        let service_loader = fx
            .registries
            .methods
            .register_loader(ServiceLoader::new("Isolated").with_binding("Greeting", "isolated::Greeting"));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_in_handler = Arc::clone(&seen);
        let handler = FnHandler::new(move |m: &MethodDescriptor, _a: &[Value], _c: &mut InvocationContext| {
            seen_in_handler.lock().push(loader::current());
            match m.name.as_str() {
                "ok" => Ok(Value::from(loader::resolve_type("Greeting").unwrap_or_default())),
                "err" => anyhow::bail!("failed"),
                _ => panic!("exploded"),
            }
        });
        fx.provide(
            ProviderConfig::new("Isolated"),
            handler,
            &[("ok", &[]), ("err", &[]), ("panic", &[])],
        );

        let worker_loader = Arc::new(ServiceLoader::new("framework"));
        let _worker = LoaderGuard::install(Some(Arc::clone(&worker_loader)));

        let ok = fx.call(Request::new("Isolated", "ok")).unwrap();
        assert_eq!(ok, Response::payload("isolated::Greeting"));
        for method in ["ok", "err", "panic"] {
            fx.call(Request::new("Isolated", method));
            let after = loader::current().unwrap();
            assert!(Arc::ptr_eq(&after, &worker_loader), "loader leaked after {method}");
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        for during in seen.iter() {
            assert!(Arc::ptr_eq(during.as_ref().unwrap(), &service_loader));
        }
    }

    #[test]
    fn deferred_completion_suppresses_pipeline_send() {
        let fx = Fixture::ready();
        let parked: Arc<Mutex<Option<CompletionHandle>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&parked);
        let handler = FnHandler::new(move |_m: &MethodDescriptor, _a: &[Value], ctx: &mut InvocationContext| {
            *slot.lock() = ctx.defer_completion();
            Ok(Value::Nil)
        });
        fx.provide(ProviderConfig::new("Async"), handler, &[("later", &[])]);

        let (completion, mut rx) = CompletionHandle::channel();
        fx.processor
            .handle_request(&StubTransport::default(), completion, Request::new("Async", "later"));

        assert!(matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)));
        assert!(fx.events.sent().is_empty());
        assert_eq!(fx.events.count(|e| matches!(e, DispatchEvent::EndHandle)), 0);
        assert_eq!(fx.lifecycle.in_flight_count(), 0);

        let handle = parked.lock().take().unwrap();
        handle.send(Response::payload("done later")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Response::payload("done later"));
        assert!(handle.send(Response::payload("again")).is_err());
    }

    #[test]
    fn provider_app_name_overrides_request_app() {
        let fx = Fixture::new(ServerConfig {
            app_name: Some("server-default".into()),
            ..ServerConfig::default()
        });
        let seen = Arc::new(Mutex::new(Vec::new()));

        for (service, owner) in [("Owned", Some("greeter-app")), ("Unowned", None)] {
            let seen = Arc::clone(&seen);
            let handler = FnHandler::new(move |_m: &MethodDescriptor, _a: &[Value], ctx: &mut InvocationContext| {
                seen.lock().push(ctx.app_name().map(str::to_owned));
                Ok(Value::Nil)
            });
            let mut config = ProviderConfig::new(service);
            config.app_name = owner.map(str::to_owned);
            fx.provide(config, handler, &[("run", &[])]);
        }

        fx.call(Request::new("Owned", "run").with_target_app("caller-app"));
        fx.call(Request::new("Unowned", "run").with_target_app("caller-app"));
        fx.call(Request::new("Unowned", "run"));

        assert_eq!(
            *seen.lock(),
            vec![
                Some("greeter-app".to_string()),
                Some("caller-app".to_string()),
                Some("server-default".to_string()),
            ]
        );
    }

    #[test]
    fn context_exposes_transport_details() {
        let fx = Fixture::ready();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let handler = FnHandler::new(move |_m: &MethodDescriptor, _a: &[Value], ctx: &mut InvocationContext| {
            *slot.lock() = Some((ctx.remote_addr(), ctx.queue_wait(), ctx.net_wait()));
            Ok(Value::Nil)
        });
        fx.provide(ProviderConfig::new("Timed"), handler, &[("run", &[])]);

        let base = Instant::now();
        let transport = StubTransport {
            marks: TimingMarks {
                enter_queue: Some(base),
                work_start: Some(base + Duration::from_millis(12)),
                header_arrived: Some(base),
                body_arrived: None,
            },
            ..StubTransport::default()
        };
        fx.call_with(&transport, Request::new("Timed", "run"));

        let (remote, queue_wait, net_wait) = seen.lock().take().unwrap();
        assert_eq!(remote, transport.remote_addr());
        assert_eq!(queue_wait, Some(Duration::from_millis(12)));
        assert_eq!(net_wait, None);
    }

    #[test]
    fn sink_failure_is_only_logged() {
        struct Broken;
        impl ResponseSink for Broken {
            fn send_response(&self, _response: Response) -> anyhow::Result<()> {
                anyhow::bail!("socket closed")
            }
        }

        let fx = Fixture::ready();
        fx.greeter();
        let completion = CompletionHandle::new(Arc::new(Broken));

        fx.processor
            .handle_request(&StubTransport::default(), completion.clone(), say_hi("bob"));

        assert!(completion.is_completed());
        assert_eq!(fx.events.sent().len(), 1);
        assert_eq!(fx.lifecycle.in_flight_count(), 0);
    }

    #[test]
    fn sink_panic_still_reports_send() {
        struct Exploding;
        impl ResponseSink for Exploding {
            fn send_response(&self, _response: Response) -> anyhow::Result<()> {
                panic!("codec blew up")
            }
        }

        let fx = Fixture::ready();
        fx.greeter();
        let completion = CompletionHandle::new(Arc::new(Exploding));

        fx.processor
            .handle_request(&StubTransport::default(), completion.clone(), say_hi("bob"));

        assert!(completion.is_completed());
        assert_eq!(
            fx.events.sent(),
            vec![DispatchEvent::Sent {
                service: "Greeter".into(),
                method: "sayHi".into(),
                response_error: None,
                error: None,
            }]
        );
        assert_eq!(fx.events.count(|e| matches!(e, DispatchEvent::EndHandle)), 1);
        assert_eq!(fx.lifecycle.in_flight_count(), 0);
    }

    #[test]
    fn admitted_request_is_served_while_draining() {
        struct Admitted;
        impl TransportContext for Admitted {
            fn remote_addr(&self) -> Option<SocketAddr> {
                None
            }
            fn is_request_timeout(&self) -> bool {
                false
            }
            fn timing(&self) -> TimingMarks {
                TimingMarks::default()
            }
            fn is_admitted(&self) -> bool {
                true
            }
        }

        let fx = Fixture::ready();
        let handler = fx.greeter();
        let admission = fx.processor.admit().unwrap();
        fx.lifecycle.trigger_shutdown();
        assert!(fx.processor.admit().is_none());

        let (completion, mut rx) = CompletionHandle::channel();
        fx.processor.handle_request(&Admitted, completion, say_hi("bob"));
        assert_eq!(rx.try_recv().unwrap(), Response::payload("hi bob"));

        let refused = error_of(fx.call(say_hi("eve")));
        assert_eq!(refused.kind, RpcErrorKind::ServerUnavailable);
        assert_eq!(handler.calls(), 1);

        drop(admission);
        assert_eq!(fx.lifecycle.in_flight_count(), 0);
    }

    #[test]
    fn concurrent_burst_balances_in_flight() {
        let fx = Fixture::ready();
        fx.greeter();
        let flaky = FnHandler::new(|_m: &MethodDescriptor, args: &[Value], _c: &mut InvocationContext| {
            match args.first().and_then(Value::as_i64) {
                Some(n) if n % 3 == 0 => anyhow::bail!("multiple of three"),
                Some(n) if n % 3 == 1 => panic!("unlucky"),
                _ => Ok(Value::Nil),
            }
        });
        fx.provide(ProviderConfig::new("Flaky"), flaky, &[("run", &["Int"])]);

        let before = fx.lifecycle.in_flight_count();
        let delivered = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for i in 0..64_i64 {
                let fx = &fx;
                let delivered = &delivered;
                s.spawn(move || {
                    let request = if i % 4 == 0 {
                        Request::new("Ghost", "run")
                    } else {
                        Request::new("Flaky", "run").with_arg("Int", i)
                    };
                    if fx.call(request).is_some() {
                        delivered.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(fx.lifecycle.in_flight_count(), before);
        assert_eq!(delivered.load(Ordering::SeqCst), 64);
        assert_eq!(fx.events.sent().len(), 64);
    }

    #[test]
    fn policy_flags_and_selector_presence() {
        let fx = Fixture::new(
            ServerConfig::default()
                .with_parameter(crate::service::config::params::TIMEOUT_DISCARD_IN_SERVER, "true"),
        );
        assert_eq!(fx.processor.interest(), Request::TYPE_NAME);
        assert_eq!(fx.processor.executor().name(), "default");
        assert!(fx.processor.timeout_discard());
        assert!(!fx.processor.process_in_io_thread());
        assert!(fx.processor.executor_selector().is_none());

        fx.registries
            .pools
            .register(ServicePool::new("Greeter", PoolConfig::named("greeter").threads(1)));
        assert!(fx.processor.executor_selector().is_some());
    }
}
