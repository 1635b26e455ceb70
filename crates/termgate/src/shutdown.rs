//! Tracking of in-flight tasks and bounded graceful shutdown.
//!
//! Every long-lived task (shell sessions, process monitors, sweepers) is
//! spawned through [`Tasks`] so shutdown can cancel them all and wait for
//! them to observe it, up to a fixed grace period.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

// ============================================================================
// Tasks
// ============================================================================

#[derive(Clone, Default)]
pub struct Tasks {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Outcome of [`Tasks::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Every task finished within the grace period.
    Complete,
    /// The grace period ran out with this many tasks still running.
    TimedOut { remaining: usize },
}

impl Tasks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a tracked task.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(future)
    }

    /// Number of tracked tasks still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every task and wait up to `grace` for them to finish.
    pub async fn shutdown(&self, grace: Duration) -> Drain {
        self.tracker.close();
        self.cancel.cancel();

        let pending = self.tracker.len();
        if pending > 0 {
            info!(pending, grace_secs = grace.as_secs(), "waiting for in-flight tasks");
        }

        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                info!("all tasks finished");
                Drain::Complete
            }
            Err(_) => {
                let remaining = self.tracker.len();
                warn!(remaining, "shutdown grace period elapsed, proceeding");
                Drain::TimedOut { remaining }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn shutdown_waits_for_cooperative_tasks() {
        let tasks = Tasks::new();
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let token = tasks.token();
            let finished = finished.clone();
            tasks.spawn(async move {
                token.cancelled().await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(tasks.active(), 3);

        assert_eq!(tasks.shutdown(Duration::from_secs(5)).await, Drain::Complete);
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert!(tasks.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_gives_up_after_grace() {
        let tasks = Tasks::new();
        tasks.spawn(std::future::pending::<()>());

        let drain = tasks.shutdown(Duration::from_secs(2)).await;
        assert_eq!(drain, Drain::TimedOut { remaining: 1 });
    }

    #[tokio::test]
    async fn shutdown_with_nothing_running() {
        let tasks = Tasks::new();
        assert_eq!(tasks.shutdown(Duration::from_millis(10)).await, Drain::Complete);
    }
}
