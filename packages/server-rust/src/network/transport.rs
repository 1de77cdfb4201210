//! Transport-side request context: peer address, expiry, and timing marks.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::traits::TransportContext;

/// Points in time the transport observed while moving a request to a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingMarks {
    /// Request was handed to a worker pool queue.
    pub enter_queue: Option<Instant>,
    /// A worker picked the request up.
    pub work_start: Option<Instant>,
    /// Protocol header was fully read.
    pub header_arrived: Option<Instant>,
    /// Request body was fully read.
    pub body_arrived: Option<Instant>,
}

impl TimingMarks {
    /// Time spent waiting in the pool queue, if both marks are present.
    #[must_use]
    pub fn queue_wait(&self) -> Option<Duration> {
        Some(self.work_start?.saturating_duration_since(self.enter_queue?))
    }

    /// Time between header and body arrival, if both marks are present.
    #[must_use]
    pub fn net_wait(&self) -> Option<Duration> {
        Some(self.body_arrived?.saturating_duration_since(self.header_arrived?))
    }
}

/// Bundled `TransportContext` for transports that track expiry by arrival
/// time plus the client's declared timeout.
#[derive(Debug, Clone)]
pub struct BizContext {
    remote_addr: Option<SocketAddr>,
    arrive_time: Instant,
    client_timeout: Option<Duration>,
    marks: TimingMarks,
}

impl BizContext {
    /// A context for a request that arrived just now.
    #[must_use]
    pub fn new(remote_addr: Option<SocketAddr>) -> Self {
        Self::arrived_at(remote_addr, Instant::now())
    }

    #[must_use]
    pub fn arrived_at(remote_addr: Option<SocketAddr>, arrive_time: Instant) -> Self {
        Self {
            remote_addr,
            arrive_time,
            client_timeout: None,
            marks: TimingMarks::default(),
        }
    }

    /// How long the client is willing to wait, measured from arrival.
    /// A zero timeout means the client waits forever.
    #[must_use]
    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    #[must_use]
    pub fn with_marks(mut self, marks: TimingMarks) -> Self {
        self.marks = marks;
        self
    }

    #[must_use]
    pub fn arrive_time(&self) -> Instant {
        self.arrive_time
    }
}

impl TransportContext for BizContext {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn is_request_timeout(&self) -> bool {
        self.client_timeout
            .is_some_and(|timeout| self.arrive_time.elapsed() > timeout)
    }

    fn timing(&self) -> TimingMarks {
        self.marks
    }
}
