//! Deadline enforcement for work that may never finish.
//!
//! Work runs on a dedicated OS thread with its own current-thread runtime and
//! reports back over a oneshot channel. The caller only waits on the channel
//! and a timer, so a worker that spins forever cannot hold up the caller.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::metrics::ClusterMetrics;

/// Why guarded work produced no result.
#[derive(Debug, Error)]
pub(crate) enum GuardError {
    #[error("deadline of {0:?} exceeded")]
    Elapsed(Duration),
    #[error("failed to start worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker exited without reporting a result")]
    WorkerLost,
}

#[derive(Debug, Default)]
struct InflightInner {
    count: AtomicUsize,
    idle: Notify,
}

/// Counts workers that have not finished yet, including ones abandoned after a
/// deadline.
#[derive(Debug, Clone, Default)]
pub(crate) struct InflightTracker {
    inner: Arc<InflightInner>,
}

impl InflightTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    fn enter(&self, metrics: ClusterMetrics) -> InflightGuard {
        let count = self.inner.count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics.set_inflight_workers(count);
        InflightGuard {
            inner: Arc::clone(&self.inner),
            metrics,
        }
    }

    /// Wait until no worker is in flight or `grace` elapses. Returns whether
    /// the tracker drained.
    pub(crate) async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() == 0;
            }
        }
    }
}

struct InflightGuard {
    inner: Arc<InflightInner>,
    metrics: ClusterMetrics,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let remaining = self.inner.count.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.set_inflight_workers(remaining);
        if remaining == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Races worker threads against a deadline.
#[derive(Debug, Clone)]
pub(crate) struct TimeoutGuard {
    inflight: InflightTracker,
    metrics: ClusterMetrics,
}

impl TimeoutGuard {
    pub(crate) fn new(inflight: InflightTracker, metrics: ClusterMetrics) -> Self {
        Self { inflight, metrics }
    }

    /// Run `task` on a fresh worker thread and wait at most `deadline` for its
    /// output. On expiry `cancellation` is fired and the worker is abandoned.
    pub(crate) async fn run<F, Fut, T>(
        &self,
        label: &'static str,
        deadline: Duration,
        cancellation: CancellationToken,
        task: F,
    ) -> Result<T, GuardError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T>,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let inflight = self.inflight.enter(self.metrics.clone());
        std::thread::Builder::new()
            .name(format!("cluster-{label}"))
            .spawn(move || {
                let _inflight = inflight;
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!(label, "failed to build worker runtime: {err}");
                        return;
                    }
                };
                let output = runtime.block_on(task());
                if tx.send(output).is_err() {
                    debug!(label, "worker finished after its caller gave up");
                }
            })
            .map_err(GuardError::Spawn)?;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(_)) => Err(GuardError::WorkerLost),
            Err(_) => {
                warn!(label, ?deadline, "deadline exceeded; abandoning worker");
                cancellation.cancel();
                Err(GuardError::Elapsed(deadline))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> (TimeoutGuard, InflightTracker) {
        let inflight = InflightTracker::new();
        (
            TimeoutGuard::new(inflight.clone(), ClusterMetrics::default()),
            inflight,
        )
    }

    #[tokio::test]
    async fn returns_worker_output_before_deadline() {
        let (guard, inflight) = guard();
        let value = guard
            .run("test", Duration::from_secs(1), CancellationToken::new(), || async { 41 + 1 })
            .await
            .expect("worker output");
        assert_eq!(value, 42);
        assert!(inflight.wait_idle(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn cancels_and_abandons_slow_workers() {
        let (guard, inflight) = guard();
        let token = CancellationToken::new();
        let observed = token.clone();
        let result = guard
            .run("test", Duration::from_millis(20), token.clone(), move || async move {
                observed.cancelled().await;
            })
            .await;
        assert!(matches!(result, Err(GuardError::Elapsed(_))));
        assert!(token.is_cancelled());
        assert!(inflight.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(inflight.count(), 0);
    }

    #[tokio::test]
    async fn wait_idle_times_out_while_workers_run() {
        let (guard, inflight) = guard();
        let release = CancellationToken::new();
        let blocker = release.clone();
        let _ = guard
            .run("test", Duration::from_millis(10), CancellationToken::new(), move || async move {
                blocker.cancelled().await;
            })
            .await;
        assert!(!inflight.wait_idle(Duration::from_millis(20)).await);
        release.cancel();
        assert!(inflight.wait_idle(Duration::from_secs(1)).await);
    }
}
