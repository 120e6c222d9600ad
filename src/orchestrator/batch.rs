//! Per-batch completion aggregation.
//!
//! One aggregator exists per (experiment, backend configuration) pair. Worker
//! tasks report each variant's terminal outcome; the decrement that brings the
//! remaining count to zero classifies the batch and resolves the shared
//! future, exactly once, regardless of completion interleaving.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::collaborators::SearchError;

/// Classification of a resolved batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every variant succeeded.
    Success,
    /// Some variants succeeded, some failed.
    PartialSuccess,
    /// Every variant failed.
    AllFailed,
}

/// Final counters for a resolved batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// The value the batch future resolves with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub status: BatchStatus,
    pub summary: BatchSummary,
}

#[derive(Debug, Error)]
pub enum BatchError {
    /// A fatal system failure aborted the batch; never retried.
    #[error("fatal search failure: {0}")]
    Fatal(#[source] SearchError),

    /// The aggregator was dropped before resolving.
    #[error("batch aggregator dropped before resolving")]
    Dropped,
}

type Resolver = oneshot::Sender<Result<BatchOutcome, BatchError>>;

struct BatchShared {
    total: usize,
    remaining: AtomicI64,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    failed_fatally: AtomicBool,
    resolver: Mutex<Option<Resolver>>,
}

/// Tracks remaining/succeeded/failed counts for one batch and resolves its
/// future when the last variant reports. Cheap to clone; all clones share
/// state.
#[derive(Clone)]
pub struct BatchAggregator {
    shared: Arc<BatchShared>,
}

/// Receives the batch outcome. Resolves exactly once.
pub struct BatchFuture {
    receiver: oneshot::Receiver<Result<BatchOutcome, BatchError>>,
}

impl BatchFuture {
    pub async fn wait(self) -> Result<BatchOutcome, BatchError> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(BatchError::Dropped),
        }
    }
}

impl BatchAggregator {
    /// Create an aggregator expecting `total` completions. A zero-variant
    /// batch resolves immediately as an empty success.
    pub fn new(total: usize) -> (Self, BatchFuture) {
        let (sender, receiver) = oneshot::channel();
        let aggregator = Self {
            shared: Arc::new(BatchShared {
                total,
                remaining: AtomicI64::new(total as i64),
                succeeded: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
                failed_fatally: AtomicBool::new(false),
                resolver: Mutex::new(Some(sender)),
            }),
        };
        if total == 0 {
            aggregator.resolve();
        }
        (aggregator, BatchFuture { receiver })
    }

    pub fn total(&self) -> usize {
        self.shared.total
    }

    /// Whether the batch's shared failure flag has been set.
    pub fn is_failed(&self) -> bool {
        self.shared.failed_fatally.load(Ordering::Acquire)
    }

    /// Record one variant success.
    pub fn complete_success(&self) {
        self.shared.succeeded.fetch_add(1, Ordering::AcqRel);
        self.finish();
    }

    /// Record one variant failure (recoverable, isolated).
    pub fn complete_failure(&self) {
        self.shared.failed.fetch_add(1, Ordering::AcqRel);
        self.finish();
    }

    /// Abort the whole batch with a fatal system failure. Only the first
    /// call rejects the future; later completions keep moving the counters
    /// without touching the published result.
    pub fn fail_fatal(&self, error: SearchError) {
        if self.shared.failed_fatally.swap(true, Ordering::AcqRel) {
            tracing::debug!(code = error.code(), "fatal failure after batch already failed");
            return;
        }
        if let Some(resolver) = self.take_resolver() {
            let _ = resolver.send(Err(BatchError::Fatal(error)));
        }
    }

    fn finish(&self) {
        // fetch_sub returns 1 for exactly one caller; completions arriving
        // after resolution drive `remaining` negative, which is tolerated.
        let previous = self.shared.remaining.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.resolve();
        }
    }

    fn resolve(&self) {
        let Some(resolver) = self.take_resolver() else {
            return;
        };
        let succeeded = self.shared.succeeded.load(Ordering::Acquire);
        let failed = self.shared.failed.load(Ordering::Acquire);
        let status = if failed == 0 {
            BatchStatus::Success
        } else if succeeded == 0 {
            BatchStatus::AllFailed
        } else {
            BatchStatus::PartialSuccess
        };
        let outcome = BatchOutcome {
            status,
            summary: BatchSummary {
                total: self.shared.total,
                succeeded,
                failed,
            },
        };
        let _ = resolver.send(Ok(outcome));
    }

    fn take_resolver(&self) -> Option<Resolver> {
        self.shared
            .resolver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl std::fmt::Debug for BatchAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchAggregator")
            .field("total", &self.shared.total)
            .field("remaining", &self.shared.remaining.load(Ordering::Acquire))
            .field("succeeded", &self.shared.succeeded.load(Ordering::Acquire))
            .field("failed", &self.shared.failed.load(Ordering::Acquire))
            .finish()
    }
}
