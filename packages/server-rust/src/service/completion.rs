//! Single-fire response delivery.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use quiver_core::Response;
use tokio::sync::oneshot;

use crate::traits::{ResponseSink, TransportContext};

/// Errors from firing a `CompletionHandle`.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("response already sent for this request")]
    AlreadyCompleted,
    #[error("response sink failed: {0}")]
    Sink(#[from] anyhow::Error),
}

struct Inner {
    sink: Arc<dyn ResponseSink>,
    fired: AtomicBool,
}

/// Delivers at most one `Response` for a request.
///
/// Clones share the same fired flag, so whichever holder fires first wins and
/// every later attempt is refused with `CompletionError::AlreadyCompleted`.
#[derive(Clone)]
pub struct CompletionHandle {
    inner: Arc<Inner>,
}

impl CompletionHandle {
    #[must_use]
    pub fn new(sink: Arc<dyn ResponseSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                fired: AtomicBool::new(false),
            }),
        }
    }

    /// A handle whose response is received on the returned channel.
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(Arc::new(OneshotSink::new(tx))), rx)
    }

    /// Fire the handle.
    ///
    /// # Errors
    ///
    /// `AlreadyCompleted` if any clone fired before; `Sink` if the transport
    /// failed to accept the response. Either way the handle stays fired.
    pub fn send(&self, response: Response) -> Result<(), CompletionError> {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            return Err(CompletionError::AlreadyCompleted);
        }
        self.inner.sink.send_response(response)?;
        Ok(())
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Forwards the response over a tokio oneshot channel.
pub struct OneshotSink {
    tx: Mutex<Option<oneshot::Sender<Response>>>,
}

impl OneshotSink {
    #[must_use]
    pub fn new(tx: oneshot::Sender<Response>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }
}

impl ResponseSink for OneshotSink {
    fn send_response(&self, response: Response) -> anyhow::Result<()> {
        let tx = self
            .tx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("oneshot sink already used"))?;
        tx.send(response)
            .map_err(|_| anyhow::anyhow!("response receiver dropped"))
    }
}

/// Drops responses whose client has already timed out instead of writing them.
///
/// Installed by the dispatcher when the processor's `timeout_discard` policy
/// is enabled.
pub struct TimeoutDiscardSink {
    inner: Arc<dyn ResponseSink>,
    transport: Arc<dyn TransportContext>,
}

impl TimeoutDiscardSink {
    #[must_use]
    pub fn new(inner: Arc<dyn ResponseSink>, transport: Arc<dyn TransportContext>) -> Self {
        Self { inner, transport }
    }
}

impl ResponseSink for TimeoutDiscardSink {
    fn send_response(&self, response: Response) -> anyhow::Result<()> {
        if self.transport.is_request_timeout() {
            tracing::warn!(
                remote = ?self.transport.remote_addr(),
                is_error = response.is_error(),
                "client timed out, response discarded"
            );
            return Ok(());
        }
        self.inner.send_response(response)
    }
}
