//! Server lifecycle with in-flight request tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and an atomic counter with
//! RAII guards, so a request is counted from admission or pickup until it is
//! done, even when it unwinds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// Server lifecycle state.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Server is initializing (not yet accepting requests).
    Starting,
    /// Server is started and accepting requests.
    Ready,
    /// Server is draining in-flight requests (new requests are refused).
    Draining,
    /// All in-flight requests completed after a shutdown.
    Stopped,
}

/// Owns the started/stopped state and the in-flight counter.
///
/// 1. The dispatcher `admit()`s queued requests while the server is `Ready`
/// 2. The dispatch pipeline checks `is_accepting()` before doing any work,
///    unless the request was admitted
/// 3. Every admitted or handled request holds an `InFlightGuard`
/// 4. `trigger_shutdown()` moves to Draining
/// 5. `wait_for_drain()` waits until the counter reaches zero
#[derive(Debug)]
pub struct ServerLifecycle {
    in_flight: Arc<AtomicU64>,
    state: Arc<ArcSwap<HealthState>>,
}

impl ServerLifecycle {
    /// Creates a lifecycle in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    /// Whether the server is started. Only `Ready` accepts work.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.health_state() == HealthState::Ready
    }

    /// Stop accepting requests. Admitted requests are still served.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(HealthState::Draining));
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    /// Counts a request in. The counter is decremented when the guard drops,
    /// including during unwinding.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Counts an accepted request in before it is queued, so a drain that
    /// starts while it waits for a worker also waits for it.
    ///
    /// Returns `None` when the server is not accepting.
    #[must_use]
    pub fn admit(&self) -> Option<InFlightGuard> {
        // Count first: a concurrent shutdown then either sees the count or
        // this call sees Draining.
        let guard = self.in_flight_guard();
        self.is_accepting().then_some(guard)
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waits for all in-flight requests to complete, up to `timeout`.
    ///
    /// Returns `true` and transitions to `Stopped` once drained; returns
    /// `false` on timeout, leaving the state at `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight_count() == 0 {
                self.state.store(Arc::new(HealthState::Stopped));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ServerLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
