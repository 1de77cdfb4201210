//! Per-request execution context and its scoped lifetime.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use super::completion::CompletionHandle;
use crate::network::{InFlightGuard, ServerLifecycle, TimingMarks};

/// Mutable state of one request, owned by the worker handling it.
///
/// Business handlers receive it by `&mut` and may read transport details,
/// attach diagnostics, or switch to deferred completion.
#[derive(Debug, Default)]
pub struct InvocationContext {
    remote_addr: Option<SocketAddr>,
    app_name: Option<String>,
    completion: Option<CompletionHandle>,
    marks: TimingMarks,
    queue_wait: Option<Duration>,
    net_wait: Option<Duration>,
    attachments: HashMap<String, String>,
    async_chain: bool,
}

impl InvocationContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn set_remote_addr(&mut self, addr: Option<SocketAddr>) {
        self.remote_addr = addr;
    }

    /// Application the request is attributed to in logs.
    #[must_use]
    pub fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }

    pub fn set_app_name(&mut self, app_name: Option<String>) {
        self.app_name = app_name;
    }

    /// Store the transport's timing marks and derive the wait durations that
    /// both of their operands allow.
    pub fn record_timing(&mut self, marks: TimingMarks) {
        self.marks = marks;
        self.queue_wait = marks.queue_wait();
        self.net_wait = marks.net_wait();
    }

    #[must_use]
    pub fn timing(&self) -> &TimingMarks {
        &self.marks
    }

    /// Time between entering the pool queue and a worker starting the request.
    #[must_use]
    pub fn queue_wait(&self) -> Option<Duration> {
        self.queue_wait
    }

    /// Time between the header and the body of the request arriving.
    #[must_use]
    pub fn net_wait(&self) -> Option<Duration> {
        self.net_wait
    }

    pub fn attach(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attachments.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn attachments(&self) -> &HashMap<String, String> {
        &self.attachments
    }

    pub(crate) fn attach_completion(&mut self, completion: CompletionHandle) {
        self.completion = Some(completion);
    }

    /// Take over responsibility for answering this request.
    ///
    /// The pipeline will not send its own response; the caller must fire the
    /// returned handle exactly once. `None` if the request has no handle
    /// (already torn down).
    pub fn defer_completion(&mut self) -> Option<CompletionHandle> {
        let handle = self.completion.clone()?;
        self.async_chain = true;
        Some(handle)
    }

    #[must_use]
    pub fn is_async_chain(&self) -> bool {
        self.async_chain
    }

    /// Read and clear the deferred-completion marker.
    pub(crate) fn take_async_chain(&mut self) -> bool {
        std::mem::take(&mut self.async_chain)
    }

    /// Forget everything attached to this request.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Scope of one handled request: counts it in-flight and owns its context.
///
/// Dropping the scope (normally or while unwinding) clears the context and
/// releases the in-flight count.
pub struct ContextScope {
    context: InvocationContext,
    _in_flight: InFlightGuard,
}

impl ContextScope {
    #[must_use]
    pub fn enter(lifecycle: &ServerLifecycle) -> Self {
        Self {
            _in_flight: lifecycle.in_flight_guard(),
            context: InvocationContext::new(),
        }
    }

    #[must_use]
    pub fn context(&self) -> &InvocationContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut InvocationContext {
        &mut self.context
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        self.context.clear();
    }
}
