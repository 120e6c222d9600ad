//! Bounded admission control for search dispatch.
//!
//! The gate is deliberately conservative - sized well below the worker count
//! so a large variant fan-out cannot overwhelm the search backend. Admission
//! is never a blocking wait: a full gate means the caller sleeps a fixed
//! delay and retries the whole attempt (backpressure, not a queue).

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::time::sleep;

/// Lower bound on permits regardless of worker count.
pub const GATE_FLOOR: usize = 2;
/// Upper bound on permits regardless of worker count.
pub const GATE_CEILING: usize = 16;
/// Fraction of available workers granted to search dispatch.
pub const WORKER_DIVISOR: usize = 2;
/// Fixed delay between admission retries.
pub const BACKPRESSURE_DELAY: Duration = Duration::from_millis(1000);

/// Permit pool size for a given worker count: `max(2, min(16, workers / 2))`.
pub fn permit_count(available_workers: usize) -> usize {
    (available_workers / WORKER_DIVISOR).clamp(GATE_FLOOR, GATE_CEILING)
}

struct GateShared {
    semaphore: Arc<Semaphore>,
    max_permits: usize,
    backpressure_delay: Duration,
    active_batches: AtomicUsize,
    active_tasks: AtomicUsize,
    waiting: AtomicUsize,
}

/// Counting-semaphore admission gate with non-blocking acquisition.
#[derive(Clone)]
pub struct ConcurrencyGate {
    shared: Arc<GateShared>,
}

impl ConcurrencyGate {
    pub fn new(max_permits: usize, backpressure_delay: Duration) -> Self {
        Self {
            shared: Arc::new(GateShared {
                semaphore: Arc::new(Semaphore::new(max_permits)),
                max_permits,
                backpressure_delay,
                active_batches: AtomicUsize::new(0),
                active_tasks: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
            }),
        }
    }

    /// Gate sized from the host's available parallelism.
    pub fn from_available_workers() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(GATE_FLOOR * WORKER_DIVISOR);
        Self::new(permit_count(workers), BACKPRESSURE_DELAY)
    }

    pub fn max_permits(&self) -> usize {
        self.shared.max_permits
    }

    pub fn backpressure_delay(&self) -> Duration {
        self.shared.backpressure_delay
    }

    /// Non-blocking permit acquisition. Dropping the permit releases it.
    pub fn try_admit(&self) -> Option<GatePermit> {
        let permit = self.shared.semaphore.clone().try_acquire_owned().ok()?;
        self.shared.active_tasks.fetch_add(1, Ordering::AcqRel);
        Some(GatePermit {
            _permit: permit,
            shared: self.shared.clone(),
        })
    }

    /// Retry admission after the fixed delay until a permit is granted or
    /// `should_abort` observes cancellation or batch failure.
    pub async fn admit_with_backpressure<F>(&self, should_abort: F) -> Option<GatePermit>
    where
        F: Fn() -> bool,
    {
        loop {
            if should_abort() {
                return None;
            }
            if let Some(permit) = self.try_admit() {
                return Some(permit);
            }
            self.shared.waiting.fetch_add(1, Ordering::AcqRel);
            sleep(self.shared.backpressure_delay).await;
            self.shared.waiting.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// RAII marker for one in-flight batch, reflected in the metrics.
    pub fn batch_guard(&self) -> BatchGuard {
        self.shared.active_batches.fetch_add(1, Ordering::AcqRel);
        BatchGuard {
            shared: self.shared.clone(),
        }
    }

    /// Read-only diagnostic snapshot for observability tooling.
    pub fn metrics(&self) -> GateMetrics {
        GateMetrics {
            configured_max: self.shared.max_permits,
            available_permits: self.shared.semaphore.available_permits(),
            active_batches: self.shared.active_batches.load(Ordering::Acquire),
            active_tasks: self.shared.active_tasks.load(Ordering::Acquire),
            waiting: self.shared.waiting.load(Ordering::Acquire),
        }
    }
}

impl std::fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGate")
            .field("metrics", &self.metrics())
            .finish()
    }
}

/// Held while one unit of search work is admitted or executing.
pub struct GatePermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
    shared: Arc<GateShared>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.shared.active_tasks.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Held while one batch is being driven through the gate.
pub struct BatchGuard {
    shared: Arc<GateShared>,
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.shared.active_batches.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Gate state snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GateMetrics {
    pub configured_max: usize,
    pub available_permits: usize,
    pub active_batches: usize,
    pub active_tasks: usize,
    pub waiting: usize,
}

// =============================================================================
// Dispatch pool
// =============================================================================

/// Dedicated bounded executor for search dispatch.
///
/// A fixed set of workers drains a bounded queue. [`try_dispatch`]
/// (DispatchPool::try_dispatch) hands the item back when the queue is full so
/// the caller can release its gate permit and retry after the backpressure
/// delay.
pub struct DispatchPool<T: Send + 'static> {
    queue: mpsc::Sender<T>,
}

impl<T: Send + 'static> Clone for DispatchPool<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<T: Send + 'static> DispatchPool<T> {
    pub fn new<F, Fut>(workers: usize, queue_capacity: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (sender, receiver) = mpsc::channel::<T>(queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        for _ in 0..workers.max(1) {
            let receiver = receiver.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    let item = { receiver.lock().await.recv().await };
                    match item {
                        Some(item) => handler(item).await,
                        None => break,
                    }
                }
            });
        }
        Self { queue: sender }
    }

    /// Non-blocking dispatch; returns the item on a full (or closed) queue.
    pub fn try_dispatch(&self, item: T) -> Result<(), T> {
        self.queue.try_send(item).map_err(|err| match err {
            TrySendError::Full(item) => item,
            TrySendError::Closed(item) => item,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permit_count_applies_floor_divisor_and_ceiling() {
        assert_eq!(permit_count(1), 2);
        assert_eq!(permit_count(4), 2);
        assert_eq!(permit_count(8), 4);
        assert_eq!(permit_count(16), 8);
        assert_eq!(permit_count(64), 16);
        assert_eq!(permit_count(1024), 16);
    }

    #[tokio::test]
    async fn try_admit_is_bounded_and_release_restores() {
        let gate = ConcurrencyGate::new(2, Duration::from_millis(1));
        let first = gate.try_admit().expect("first permit");
        let second = gate.try_admit().expect("second permit");
        assert!(gate.try_admit().is_none());
        assert_eq!(gate.metrics().available_permits, 0);
        assert_eq!(gate.metrics().active_tasks, 2);

        drop(first);
        assert_eq!(gate.metrics().available_permits, 1);
        let third = gate.try_admit().expect("permit after release");
        drop(second);
        drop(third);
        assert_eq!(gate.metrics().available_permits, 2);
        assert_eq!(gate.metrics().active_tasks, 0);
    }

    #[tokio::test]
    async fn backpressure_admission_aborts_on_request() {
        let gate = ConcurrencyGate::new(1, Duration::from_millis(5));
        let held = gate.try_admit().expect("permit");

        let aborted = gate.admit_with_backpressure(|| true).await;
        assert!(aborted.is_none());
        drop(held);

        let granted = gate.admit_with_backpressure(|| false).await;
        assert!(granted.is_some());
    }

    #[tokio::test]
    async fn dispatch_pool_returns_item_when_queue_full() {
        // No workers draining quickly: use a handler that parks forever.
        let pool: DispatchPool<u32> = DispatchPool::new(1, 1, |_item| async {
            futures::future::pending::<()>().await;
        });

        // First item is picked up by the (parked) worker, second fills the
        // queue, third must bounce.
        assert!(pool.try_dispatch(1).is_ok());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.try_dispatch(2).is_ok());
        assert_eq!(pool.try_dispatch(3), Err(3));
    }
}
