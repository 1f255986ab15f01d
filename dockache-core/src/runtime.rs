//! Shared task context: spawning, cancellation, graceful drain.
//!
//! Every background task the cache layer starts (change-stream consumers,
//! reconnect supervisors, token promotion ticks) is spawned through a
//! [`TaskContext`], so shutdown has one place to stop accepting work, wait
//! out in-flight tasks under a bounded deadline, and hard-cancel survivors.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Default drain deadline applied by [`TaskContext::shutdown`].
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(60);

const DRAIN_POLL: Duration = Duration::from_millis(100);
const DRAIN_WARN_CADENCE: Duration = Duration::from_secs(1);

/// Cooperative scheduler wrapper shared by a cache and its replicator.
pub struct TaskContext {
    tracker: TaskTracker,
    cancel: CancellationToken,
    aborts: Mutex<Vec<AbortHandle>>,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskContext {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            aborts: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a tracked task on the current runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = self.tracker.spawn(future);
        let mut aborts = self.aborts.lock();
        aborts.retain(|h| !h.is_finished());
        aborts.push(handle.abort_handle());
        handle
    }

    /// Token tripped when shutdown begins. Tasks watch this at their
    /// suspension points.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A child token that can be cancelled independently but also trips
    /// with the context.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Drain with the default 60 s deadline.
    pub async fn shutdown(&self) {
        self.shutdown_with_deadline(DRAIN_DEADLINE).await;
    }

    /// Stop accepting new work, await in-flight tasks under `deadline`,
    /// then hard-cancel any survivors.
    pub async fn shutdown_with_deadline(&self, deadline: Duration) {
        self.cancel.cancel();
        self.tracker.close();

        let started = Instant::now();
        let mut last_warn = Instant::now();
        while !self.tracker.is_empty() {
            if started.elapsed() >= deadline {
                let survivors = self.tracker.len();
                warn!(survivors, "drain deadline reached, aborting remaining tasks");
                for handle in self.aborts.lock().drain(..) {
                    handle.abort();
                }
                break;
            }
            if last_warn.elapsed() >= DRAIN_WARN_CADENCE {
                warn!(
                    remaining = self.tracker.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "waiting for in-flight tasks to drain"
                );
                last_warn = Instant::now();
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        self.tracker.wait().await;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "task context drained");
    }
}
