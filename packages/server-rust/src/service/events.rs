//! Pipeline events and their sinks.
//!
//! Events are built lazily: with no sink subscribed, `publish` does not even
//! construct the event.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use quiver_core::{RpcError, RpcErrorKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// A request entered the pipeline.
    Received {
        service: String,
        method: String,
        remote: Option<SocketAddr>,
    },
    /// Business logic ran (successfully or not).
    Invoked {
        service: String,
        method: String,
        elapsed: Duration,
        ok: bool,
    },
    /// The pipeline fired the completion handle.
    Sent {
        service: String,
        method: String,
        /// Kind of the error response, if the response was an error.
        response_error: Option<RpcErrorKind>,
        /// Diagnostic error recorded while handling, if any.
        error: Option<RpcError>,
    },
    /// The pipeline is done with a request it answered itself.
    EndHandle,
}

pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &DispatchEvent);
}

/// Fan-out to subscribed sinks. Cloning shares the subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Arc<ArcSwap<Vec<Arc<dyn EventSink>>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.sinks.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&sink));
            next
        });
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.sinks.load().is_empty()
    }

    pub fn publish(&self, event: impl FnOnce() -> DispatchEvent) {
        let sinks = self.sinks.load();
        if sinks.is_empty() {
            return;
        }
        let event = event();
        for sink in sinks.iter() {
            sink.on_event(&event);
        }
    }
}

// ---------------------------------------------------------------------------
// Bundled sinks
// ---------------------------------------------------------------------------

/// Logs every event at `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_event(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::Received { service, method, remote } => {
                tracing::debug!(%service, %method, ?remote, "request received");
            }
            DispatchEvent::Invoked { service, method, elapsed, ok } => {
                #[allow(clippy::cast_possible_truncation)]
                let elapsed_ms = elapsed.as_millis() as u64;
                tracing::debug!(%service, %method, elapsed_ms, ok, "request invoked");
            }
            DispatchEvent::Sent { service, method, response_error, error } => {
                tracing::debug!(
                    %service,
                    %method,
                    response_error = response_error.map(RpcErrorKind::as_str),
                    error = error.as_ref().map(tracing::field::display),
                    "response sent"
                );
            }
            DispatchEvent::EndHandle => tracing::trace!("request handling finished"),
        }
    }
}

/// Records counters and latency histograms through the `metrics` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsEventSink;

impl EventSink for MetricsEventSink {
    fn on_event(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::Received { service, .. } => {
                metrics::counter!("quiver_requests_received_total", "service" => service.clone())
                    .increment(1);
            }
            DispatchEvent::Invoked { service, elapsed, ok, .. } => {
                let outcome = if *ok { "ok" } else { "error" };
                metrics::histogram!(
                    "quiver_invocation_seconds",
                    "service" => service.clone(),
                    "outcome" => outcome
                )
                .record(elapsed.as_secs_f64());
            }
            DispatchEvent::Sent { service, response_error, .. } => {
                let outcome = response_error.map_or("ok", RpcErrorKind::as_str);
                metrics::counter!(
                    "quiver_responses_sent_total",
                    "service" => service.clone(),
                    "outcome" => outcome
                )
                .increment(1);
            }
            DispatchEvent::EndHandle => {}
        }
    }
}
