//! Leadership attempt
//!
//! Owns one held lease for its whole life: runs the task and the renewal unit
//! side by side, stops both as soon as either one reports, and releases the
//! lease only after everything it started has wound down (or the drain timeout
//! ran out, in which case the task is left to finish on its own).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{LockError, RecoveredPanic, TaskError};
use crate::lock::Lease;
use crate::renewal::spawn_renewal;
use crate::task::{spawn_task, LeaderTask};

/// How a leadership attempt ended.
#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    /// The task returned `Ok(())` on its own.
    Completed,
    /// The task returned an error or panicked.
    TaskFailed(TaskError),
    /// The lease could not be extended.
    RenewalFailed(LockError),
    /// The controller was closed while the attempt was running.
    Cancelled,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Completed => write!(f, "task completed"),
            AttemptOutcome::TaskFailed(e) => write!(f, "{}", e),
            AttemptOutcome::RenewalFailed(e) => write!(f, "lease renewal failed: {}", e),
            AttemptOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Timing for a single attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttemptTiming {
    pub ttl: Duration,
    pub renewal_interval: Duration,
    pub drain_timeout: Duration,
}

pub(crate) struct LeadershipAttempt {
    lease: Arc<dyn Lease>,
    cancel: CancellationToken,
    timing: AttemptTiming,
}

impl LeadershipAttempt {
    /// `cancel` must be a fresh child of the controller's root token.
    pub(crate) fn new(lease: Box<dyn Lease>, cancel: CancellationToken, timing: AttemptTiming) -> Self {
        Self {
            lease: Arc::from(lease),
            cancel,
            timing,
        }
    }

    pub(crate) async fn run(self, task: Arc<dyn LeaderTask>) -> AttemptOutcome {
        let (mut task_rx, task_handle) = spawn_task(task, self.cancel.clone());
        let (mut renewal_rx, renewal_handle) = spawn_renewal(
            self.lease.clone(),
            self.timing.ttl,
            self.timing.renewal_interval,
            self.cancel.clone(),
        );

        let outcome = tokio::select! {
            result = &mut task_rx => match result {
                Ok(Ok(())) => AttemptOutcome::Completed,
                Ok(Err(e)) => AttemptOutcome::TaskFailed(e),
                Err(_) => AttemptOutcome::TaskFailed(
                    RecoveredPanic::new("task unit ended without reporting an outcome").into(),
                ),
            },
            result = &mut renewal_rx => match result {
                Ok(e) => AttemptOutcome::RenewalFailed(e),
                // The unit only stops silently when cancelled
                Err(_) if self.cancel.is_cancelled() => AttemptOutcome::Cancelled,
                Err(_) => AttemptOutcome::RenewalFailed(LockError::Backend(
                    "renewal unit ended without reporting an outcome".to_string(),
                )),
            },
            _ = self.cancel.cancelled() => AttemptOutcome::Cancelled,
        };

        self.cancel.cancel();

        // Renewal reacts to cancellation immediately, so the lease is ours alone after this
        let _ = renewal_handle.await;
        self.drain_task(task_handle).await;
        self.release().await;

        outcome
    }

    /// Wait for the task to honour cancellation. A task that outlasts the drain
    /// window keeps running detached; it is never preempted.
    async fn drain_task(&self, handle: JoinHandle<()>) {
        if tokio::time::timeout(self.timing.drain_timeout, handle).await.is_err() {
            warn!(
                drain_timeout_ms = self.timing.drain_timeout.as_millis() as u64,
                "Task still running after cancellation, releasing lease anyway"
            );
        }
    }

    async fn release(&self) {
        match self.lease.release().await {
            Ok(()) => debug!(key = %self.lease.key(), "Lease released"),
            Err(e) => warn!(key = %self.lease.key(), error = %e, "Failed to release lease, leaving it to expire"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::lock::LockService;
    use crate::memory_lock::MemoryLockStore;

    fn timing() -> AttemptTiming {
        AttemptTiming {
            ttl: Duration::from_secs(3),
            renewal_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_task_releases_lease() {
        let store = MemoryLockStore::new();
        let lease = store.client().obtain("job", Duration::from_secs(3)).await.unwrap();

        let task: Arc<dyn LeaderTask> = Arc::new(|_cancel: CancellationToken| async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            Ok::<(), anyhow::Error>(())
        });

        let outcome = LeadershipAttempt::new(lease, CancellationToken::new(), timing())
            .run(task)
            .await;

        assert!(matches!(outcome, AttemptOutcome::Completed));
        assert!(!store.is_held("job"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_failure_cancels_task() {
        let store = MemoryLockStore::new();
        let client = store.client();
        let lease = client.obtain("job", Duration::from_secs(3)).await.unwrap();

        let saw_cancel = Arc::new(AtomicBool::new(false));
        let flag = saw_cancel.clone();
        let task: Arc<dyn LeaderTask> = Arc::new(move |cancel: CancellationToken| {
            let flag = flag.clone();
            async move {
                cancel.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        });

        let killer = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            killer.close();
        });

        let outcome = LeadershipAttempt::new(lease, CancellationToken::new(), timing())
            .run(task)
            .await;

        assert!(matches!(outcome, AttemptOutcome::RenewalFailed(LockError::Closed)));
        assert!(saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_ends_attempt() {
        let store = MemoryLockStore::new();
        let lease = store.client().obtain("job", Duration::from_secs(3)).await.unwrap();

        fn explode() -> anyhow::Result<()> {
            panic!("bad state")
        }
        let task: Arc<dyn LeaderTask> = Arc::new(|_cancel: CancellationToken| async { explode() });

        let outcome = LeadershipAttempt::new(lease, CancellationToken::new(), timing())
            .run(task)
            .await;

        match outcome {
            AttemptOutcome::TaskFailed(TaskError::Panicked(p)) => assert_eq!(p.message(), "bad state"),
            other => panic!("unexpected outcome: {}", other),
        }
        assert!(!store.is_held("job"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_ends_attempt() {
        let store = MemoryLockStore::new();
        let lease = store.client().obtain("job", Duration::from_secs(3)).await.unwrap();

        let root = CancellationToken::new();
        let task: Arc<dyn LeaderTask> = Arc::new(|cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Ok::<(), anyhow::Error>(())
        });

        let closer = root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            closer.cancel();
        });

        let outcome = LeadershipAttempt::new(lease, root.child_token(), timing())
            .run(task)
            .await;

        // Either the task's own return or the cancellation branch may win the race
        assert!(matches!(outcome, AttemptOutcome::Cancelled | AttemptOutcome::Completed));
        assert!(!store.is_held("job"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_task_is_not_preempted() {
        let store = MemoryLockStore::new();
        let client = store.client();
        let lease = client.obtain("job", Duration::from_secs(3)).await.unwrap();

        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let task: Arc<dyn LeaderTask> = Arc::new(move |_cancel: CancellationToken| {
            let counter = counter.clone();
            async move {
                // Ignores cancellation entirely
                tokio::time::sleep(Duration::from_secs(3600)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        });

        let root = CancellationToken::new();
        let closer = root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            closer.cancel();
        });

        let started = tokio::time::Instant::now();
        let outcome = LeadershipAttempt::new(lease, root.child_token(), timing())
            .run(task)
            .await;

        assert!(matches!(outcome, AttemptOutcome::Cancelled));
        // Cancelled at 2s, then one drain timeout
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3100));
        assert!(!store.is_held("job"));

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cleanup_runs_to_completion() {
        let store = MemoryLockStore::new();
        let lease = store.client().obtain("job", Duration::from_secs(3)).await.unwrap();

        let cleaned_up = Arc::new(AtomicBool::new(false));
        let flag = cleaned_up.clone();
        let task: Arc<dyn LeaderTask> = Arc::new(move |cancel: CancellationToken| {
            let flag = flag.clone();
            async move {
                cancel.cancelled().await;
                // Cleanup takes longer than the drain window
                tokio::time::sleep(Duration::from_millis(1500)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        });

        let root = CancellationToken::new();
        let closer = root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            closer.cancel();
        });

        let outcome = LeadershipAttempt::new(lease, root.child_token(), timing())
            .run(task)
            .await;

        assert!(matches!(outcome, AttemptOutcome::Cancelled));
        assert!(!store.is_held("job"));
        assert!(!cleaned_up.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(cleaned_up.load(Ordering::SeqCst));
    }

    /// Lease whose refresh panics, standing in for a buggy backend.
    struct PanickingLease {
        released: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Lease for PanickingLease {
        fn key(&self) -> &str {
            "job"
        }

        async fn refresh(&self, _ttl: Duration) -> Result<(), LockError> {
            panic!("backend bug")
        }

        async fn release(&self) -> Result<(), LockError> {
            self.released.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_panic_ends_leadership_before_expiry() {
        let lease = Arc::new(PanickingLease {
            released: AtomicBool::new(false),
        });

        let running = Arc::new(AtomicBool::new(false));
        let flag = running.clone();
        let task: Arc<dyn LeaderTask> = Arc::new(move |cancel: CancellationToken| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                cancel.cancelled().await;
                flag.store(false, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        });

        let started = tokio::time::Instant::now();
        let attempt = LeadershipAttempt {
            lease: lease.clone(),
            cancel: CancellationToken::new(),
            timing: timing(),
        };
        let outcome = attempt.run(task).await;

        assert!(matches!(outcome, AttemptOutcome::RenewalFailed(LockError::Backend(_))));
        // Ended at the first refresh, well inside the ttl
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!running.load(Ordering::SeqCst));
        assert!(lease.released.load(Ordering::SeqCst));
    }
}
