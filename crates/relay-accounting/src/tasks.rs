//! Background post-flight task group.
//!
//! Post-stream accounting is fire-and-forget from the client's point of
//! view, but not from the process's: tasks run under a shared semaphore
//! bounding how many execute at once, an outstanding counter tracks them,
//! and shutdown drains the group with a deadline so accounting is not lost
//! on restart. Task panics are contained by the tokio task boundary and
//! never reach a response.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

/// Bounded group of detached tasks
pub struct TaskGroup {
    running: Arc<Semaphore>,
    outstanding: Arc<AtomicUsize>,
}

impl TaskGroup {
    /// Create a group running at most `max_running` tasks concurrently
    #[must_use]
    pub fn new(max_running: usize) -> Self {
        Self {
            running: Arc::new(Semaphore::new(max_running)),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn a detached task into the group.
    ///
    /// Outside a runtime (process teardown) the task is dropped rather
    /// than panicking the caller.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, dropping background task");
            return;
        };

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let outstanding = Arc::clone(&self.outstanding);

        handle.spawn(async move {
            // Closed only if the process is tearing the runtime down
            if let Ok(_permit) = running.acquire().await {
                future.await;
            }
            outstanding.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Number of tasks spawned but not yet finished
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Wait for the group to empty, up to `deadline`. Returns whether the
    /// group fully drained.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let result = tokio::time::timeout(deadline, async {
            while self.outstanding.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        if result.is_err() {
            warn!(
                outstanding = self.outstanding(),
                "Shutdown drain deadline reached with accounting tasks outstanding"
            );
        }
        result.is_ok()
    }
}
