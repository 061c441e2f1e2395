//! Worker pool for customer code, link sends, and termination notifications.
//!
//! Tasks run on a tokio runtime handle, optionally bounded by a semaphore.
//! Every task's result is observed: errors and panics are logged and counted
//! rather than disappearing with a detached `JoinHandle`. An atomic counter
//! with RAII guards tracks in-flight tasks so callers can wait for the pool to
//! drain.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::error;

use crate::config::EngineConfig;
use crate::error::EngineError;

// ---------------------------------------------------------------------------
// WorkPool
// ---------------------------------------------------------------------------

/// Cloneable handle to the shared worker pool.
#[derive(Clone)]
pub struct WorkPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    handle: Handle,
    permits: Option<Arc<Semaphore>>,
    in_flight: AtomicU64,
    drained: Notify,
    failures: AtomicU64,
}

impl fmt::Debug for WorkPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkPool")
            .field("bounded", &self.inner.permits.is_some())
            .field("in_flight", &self.in_flight())
            .field("failures", &self.failures())
            .finish_non_exhaustive()
    }
}

impl WorkPool {
    /// Creates a pool that spawns onto `handle`, running at most
    /// `max_concurrent_tasks` tasks at once (`None` for unbounded).
    #[must_use]
    pub fn new(handle: Handle, max_concurrent_tasks: Option<usize>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                handle,
                permits: max_concurrent_tasks.map(|n| Arc::new(Semaphore::new(n.max(1)))),
                in_flight: AtomicU64::new(0),
                drained: Notify::new(),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a pool on the runtime of the calling thread.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NoRuntime` when called outside a tokio runtime.
    pub fn current(max_concurrent_tasks: Option<usize>) -> Result<Self, EngineError> {
        Ok(Self::new(Handle::try_current()?, max_concurrent_tasks))
    }

    /// Creates a pool on the current runtime bounded by `config.max_concurrent_tasks`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NoRuntime` when called outside a tokio runtime.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        Self::current(config.max_concurrent_tasks)
    }

    /// Submits a task. Submission never blocks; the task waits for a permit
    /// on the pool itself. `task` names the task in logs and metrics.
    pub fn spawn<F>(&self, task: &'static str, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let guard = InFlightGuard::new(Arc::clone(&self.inner));
        self.inner.handle.spawn(async move {
            let _permit = match &guard.inner.permits {
                Some(permits) => Arc::clone(permits).acquire_owned().await.ok(),
                None => None,
            };
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => guard.inner.record_failure(task, &format!("{err:#}")),
                Err(_) => guard.inner.record_failure(task, "task panicked"),
            }
        });
    }

    /// Spawns a timer task outside the concurrency bound and the in-flight
    /// count. The returned handle is used to cancel the timer.
    pub(crate) fn spawn_timer<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// Number of submitted tasks that have not finished yet.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Number of tasks that returned an error or panicked.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::Relaxed)
    }

    /// Waits until no task is in flight, up to `timeout`.
    ///
    /// Returns `true` if the pool drained, `false` if the timeout expired.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let drained = self.inner.drained.notified();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }
}

impl PoolInner {
    fn record_failure(&self, task: &'static str, error: &str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ticketline_pool_task_failures_total", "task" => task).increment(1);
        error!(task, error, "pool task failed");
    }
}

// ---------------------------------------------------------------------------
// InFlightGuard
// ---------------------------------------------------------------------------

/// RAII guard that decrements the in-flight counter when dropped, waking
/// drain waiters when it reaches zero.
struct InFlightGuard {
    inner: Arc<PoolInner>,
}

impl InFlightGuard {
    fn new(inner: Arc<PoolInner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        Self { inner }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
