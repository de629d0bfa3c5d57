//! Work queue for worker units.
//!
//! A thin pool wrapper: one live worker unit per provisioned slot (the run
//! driver enqueues a unit for a slot only when that slot's previous unit
//! has reported), a cancel-all switch for aborts and early completion, and
//! a drain point the driver blocks on before computing the verdict.
//!
//! Cancellation is cooperative: units observe the token at their next
//! decision point and kill their external process before exiting, so
//! cancel-all terminates in-flight runs rather than abandoning them.

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Bounded-concurrency pool of worker units.
pub struct WorkQueue {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl WorkQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }

    /// Returns the cancellation token shared with every enqueued unit.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Enqueues one worker unit.
    pub fn spawn<F>(&self, unit: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(unit);
    }

    /// Cancels all outstanding units.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns whether cancel-all has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Blocks until every enqueued unit has finished.
    ///
    /// No further units may be enqueued after this is called.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn wait_drains_all_units() {
        let queue = WorkQueue::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let done = done.clone();
            queue.spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        queue.wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancel_reaches_every_unit() {
        let queue = WorkQueue::new();
        let cancelled = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let token = queue.cancellation_token();
            let cancelled = cancelled.clone();
            queue.spawn(async move {
                token.cancelled().await;
                cancelled.fetch_add(1, Ordering::SeqCst);
            });
        }

        queue.cancel();
        queue.wait().await;
        assert_eq!(cancelled.load(Ordering::SeqCst), 3);
        assert!(queue.is_cancelled());
    }

    #[tokio::test]
    async fn units_enqueued_after_completion_still_run() {
        let queue = WorkQueue::new();
        let done = Arc::new(AtomicUsize::new(0));

        let first = done.clone();
        queue.spawn(async move {
            first.fetch_add(1, Ordering::SeqCst);
        });

        // A retry unit enqueued later joins the same drain point.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = done.clone();
        queue.spawn(async move {
            second.fetch_add(1, Ordering::SeqCst);
        });

        queue.wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }
}
