//! Request dispatch: hands decoded requests to the processor that declared
//! interest in their type, on the thread or pool the processor asks for.

use std::collections::HashMap;
use std::future::{ready, Ready};
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use quiver_core::{Request, RequestHeader, Response, RpcError, RpcErrorKind};
use tower::Service;

use super::completion::{CompletionHandle, TimeoutDiscardSink};
use super::executor::{Executor, RejectReason};
use super::processor::{app_label, RequestProcessor};
use crate::network::{InFlightGuard, TimingMarks};
use crate::traits::{ResponseSink, TransportContext};

// ---------------------------------------------------------------------------
// InboundCall
// ---------------------------------------------------------------------------

/// A decoded request together with its connection.
pub struct InboundCall {
    pub request_type: String,
    pub transport: Arc<dyn TransportContext>,
    /// Header metadata available before the body is handled.
    pub header: Option<RequestHeader>,
    pub sink: Arc<dyn ResponseSink>,
    pub request: Request,
}

impl InboundCall {
    #[must_use]
    pub fn new(transport: Arc<dyn TransportContext>, sink: Arc<dyn ResponseSink>, request: Request) -> Self {
        Self {
            request_type: Request::TYPE_NAME.to_owned(),
            transport,
            header: None,
            sink,
            request,
        }
    }

    #[must_use]
    pub fn with_header(mut self, header: RequestHeader) -> Self {
        self.header = Some(header);
        self
    }

    #[must_use]
    pub fn with_request_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = request_type.into();
        self
    }
}

/// Where an accepted call is being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    /// Already handled on the dispatching thread.
    Inline,
    /// Queued on a worker pool.
    Queued,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no processor registered for request type {request_type}")]
    UnknownInterest { request_type: String },

    /// The client was already answered with an error response.
    #[error("executor {executor} rejected the request: {reason:?}")]
    Rejected { executor: String, reason: RejectReason },
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes `InboundCall`s to processors by request type.
///
/// Cloning is cheap; clones share the registered processors.
#[derive(Clone, Default)]
pub struct Dispatcher {
    processors: HashMap<&'static str, Arc<dyn RequestProcessor>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor under its declared interest, replacing any
    /// previous processor for that type.
    pub fn register(&mut self, processor: Arc<dyn RequestProcessor>) {
        self.processors.insert(processor.interest(), processor);
    }

    /// Schedule one call. Never blocks on a full pool.
    ///
    /// # Errors
    ///
    /// Returns `UnknownInterest` when no processor handles the request type
    /// (the call is dropped unanswered), or `Rejected` when the chosen pool
    /// refused the job (the client has been sent an error response).
    pub fn dispatch(&self, call: InboundCall) -> Result<Scheduled, DispatchError> {
        let Some(processor) = self.processors.get(call.request_type.as_str()) else {
            tracing::warn!(request_type = %call.request_type, "no processor for request type");
            return Err(DispatchError::UnknownInterest {
                request_type: call.request_type,
            });
        };
        let processor = Arc::clone(processor);

        let sink: Arc<dyn ResponseSink> = if processor.timeout_discard() {
            Arc::new(TimeoutDiscardSink::new(call.sink, Arc::clone(&call.transport)))
        } else {
            call.sink
        };
        let completion = CompletionHandle::new(sink);

        if processor.process_in_io_thread() {
            processor.handle_request(&*call.transport, completion, call.request);
            return Ok(Scheduled::Inline);
        }

        let executor = processor.executor_selector().map_or_else(
            || processor.executor(),
            |selector| selector.select(&call.request_type, call.header.as_ref()),
        );

        let app_name = call.request.target_app_name().map(str::to_owned);
        let queued = QueuedTransport::enqueue(call.transport, processor.admit());
        let job_completion = completion.clone();
        let request = call.request;
        let job = Box::new(move || {
            let transport = queued.start();
            processor.handle_request(&transport, job_completion, request);
        });

        match executor.execute(job) {
            Ok(()) => Ok(Scheduled::Queued),
            Err(rejected) => {
                let reason = rejected.reason;
                // Releases the admission taken above.
                drop(rejected.job);
                reject(executor.as_ref(), reason, &completion, app_name.as_deref());
                Err(DispatchError::Rejected {
                    executor: executor.name().to_owned(),
                    reason,
                })
            }
        }
    }
}

impl Service<InboundCall> for Dispatcher {
    type Response = Scheduled;
    type Error = DispatchError;
    type Future = Ready<Result<Scheduled, DispatchError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Backpressure is the pools' job: a full pool answers ServerBusy.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: InboundCall) -> Self::Future {
        ready(self.dispatch(call))
    }
}

fn reject(executor: &dyn Executor, reason: RejectReason, completion: &CompletionHandle, app_name: Option<&str>) {
    let err = match reason {
        RejectReason::Saturated => RpcError::server_busy(executor.name()),
        RejectReason::ShutDown => RpcError::new(
            RpcErrorKind::ServerUnavailable,
            format!("worker pool [{}] is shut down", executor.name()),
        ),
    };
    tracing::warn!(app = app_label(app_name), executor = executor.name(), error = %err, "request rejected");
    if let Err(send_err) = completion.send(Response::from(&err)) {
        tracing::warn!(app = app_label(app_name), error = %send_err, "failed to answer rejected request");
    }
}

// ---------------------------------------------------------------------------
// QueuedTransport
// ---------------------------------------------------------------------------

/// Transport view that adds the queue timestamps of a pooled request and
/// holds its admission until the job is done or dropped.
struct QueuedTransport {
    inner: Arc<dyn TransportContext>,
    marks: TimingMarks,
    admission: Option<InFlightGuard>,
}

impl QueuedTransport {
    fn enqueue(inner: Arc<dyn TransportContext>, admission: Option<InFlightGuard>) -> Self {
        let mut marks = inner.timing();
        marks.enter_queue.get_or_insert_with(Instant::now);
        Self {
            inner,
            marks,
            admission,
        }
    }

    fn start(mut self) -> Self {
        self.marks.work_start = Some(Instant::now());
        self
    }
}

impl TransportContext for QueuedTransport {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }

    fn is_request_timeout(&self) -> bool {
        self.inner.is_request_timeout()
    }

    fn timing(&self) -> TimingMarks {
        self.marks
    }

    fn is_admitted(&self) -> bool {
        self.admission.is_some() || self.inner.is_admitted()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
