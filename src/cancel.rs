//! Cooperative cancellation for an entire run tree.
//!
//! A [`CancellationToken`] is created per scheduled run and handed to every
//! component that may need to stop early: the coordinator checks it before
//! fanning out a query text, the task orchestrator checks it before admitting
//! a variant, and the timeout watchdog cancels it on expiry. Cancellation is
//! cooperative: nothing already dispatched is forcibly killed, but no new work
//! is admitted once the flag is observed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Shared cancellation flag with registered cleanup callbacks.
///
/// Once cancelled the flag never reverts. Every callback registered before
/// cancellation runs exactly once, in registration order, synchronously
/// inside [`cancel()`](CancellationToken::cancel); callbacks registered after
/// cancellation run immediately on the registering thread. Callbacks are
/// expected to be short; a long-running callback blocks the canceller.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    owner: String,
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
}

impl CancellationToken {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                owner: owner.into(),
                cancelled: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Diagnostic owner id (typically the run or schedule id).
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Flip the flag and run every registered callback in registration order.
    ///
    /// Idempotent: only the first call drains the callback list. The flag
    /// flip and the drain happen under one lock acquisition, so a concurrent
    /// [`on_cancel`](Self::on_cancel) either lands in the drained list or
    /// observes the flag and runs immediately — never neither.
    pub fn cancel(&self) {
        let drained = {
            let mut callbacks = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.inner.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *callbacks)
        };
        tracing::debug!(owner = %self.inner.owner, callbacks = drained.len(), "cancellation requested");
        for callback in drained {
            callback();
        }
    }

    /// Register a cleanup callback, or run it immediately if already
    /// cancelled. Panics inside the callback are not caught.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut callbacks = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !self.inner.cancelled.load(Ordering::Acquire) {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("owner", &self.inner.owner)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// One-shot completion signal the top-level caller blocks on.
///
/// Released exactly once when a run finalizes, and force-released by the
/// cancellation callback so callers are never left waiting on work that will
/// not report back. Waiters that arrive after release resolve immediately.
#[derive(Clone)]
pub struct CompletionLatch {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CompletionLatch {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn is_released(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Idempotent release.
    pub fn release(&self) {
        self.sender.send_replace(true);
    }

    pub async fn wait(&self) {
        let mut receiver = self.receiver.clone();
        // The sender half lives in self, so wait_for cannot error.
        let _ = receiver.wait_for(|released| *released).await;
    }
}

impl std::fmt::Debug for CompletionLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionLatch")
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_is_idempotent_and_runs_callbacks_in_order() {
        let token = CancellationToken::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            token.on_cancel(move || order.lock().unwrap().push(i));
        }

        token.cancel();
        token.cancel();

        assert!(token.is_cancelled());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn late_registration_runs_immediately() {
        let token = CancellationToken::new("test");
        token.cancel();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        token.on_cancel(move || flag.store(true, Ordering::SeqCst));

        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn concurrent_cancel_runs_each_callback_once() {
        for _ in 0..50 {
            let token = CancellationToken::new("race");
            let count = Arc::new(AtomicUsize::new(0));
            for _ in 0..4 {
                let count = count.clone();
                token.on_cancel(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                });
            }

            let a = token.clone();
            let b = token.clone();
            let ta = std::thread::spawn(move || a.cancel());
            let tb = std::thread::spawn(move || b.cancel());
            ta.join().unwrap();
            tb.join().unwrap();

            assert_eq!(count.load(Ordering::SeqCst), 4);
        }
    }

    #[tokio::test]
    async fn latch_releases_current_and_future_waiters() {
        let latch = CompletionLatch::new();
        let waiter = latch.clone();
        let pending = tokio::spawn(async move { waiter.wait().await });

        latch.release();
        latch.release();
        pending.await.unwrap();

        // Late waiter resolves immediately.
        latch.wait().await;
        assert!(latch.is_released());
    }
}
