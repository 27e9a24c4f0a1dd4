//! Task execution unit
//!
//! Runs the user's task under the attempt's cancellation token behind a
//! protected boundary: a panic inside the task is caught and reported as a
//! `RecoveredPanic` on the same channel as a normal return.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::error::{RecoveredPanic, TaskError};

/// The work that only the current leader may run.
///
/// `run` must return promptly once `cancel` fires: the engine never preempts it.
/// Closures of the shape `Fn(CancellationToken) -> impl Future<Output = anyhow::Result<()>>`
/// implement this trait.
#[async_trait]
pub trait LeaderTask: Send + Sync + 'static {
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> LeaderTask for F
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        (self)(cancel).await
    }
}

pub(crate) type TaskOutcome = Result<(), TaskError>;

/// Spawn the task. The receiver yields exactly one outcome.
pub(crate) fn spawn_task(
    task: Arc<dyn LeaderTask>,
    cancel: CancellationToken,
) -> (oneshot::Receiver<TaskOutcome>, JoinHandle<()>) {
    let (tx, rx) = oneshot::channel();

    let handle = tokio::spawn(
        async move {
            let outcome = run_protected(task, cancel).await;
            // The attempt may already have moved on
            let _ = tx.send(outcome);
        }
        .instrument(Span::current()),
    );

    (rx, handle)
}

async fn run_protected(task: Arc<dyn LeaderTask>, cancel: CancellationToken) -> TaskOutcome {
    let result = AssertUnwindSafe(async move { task.run(cancel).await })
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TaskError::Failed(e)),
        Err(payload) => Err(RecoveredPanic::from_payload(payload).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_successful_task() {
        let task: Arc<dyn LeaderTask> = Arc::new(|_cancel: CancellationToken| async { Ok::<(), anyhow::Error>(()) });
        let (rx, handle) = spawn_task(task, CancellationToken::new());

        assert!(matches!(rx.await, Ok(Ok(()))));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_task_error_is_reported() {
        let task: Arc<dyn LeaderTask> =
            Arc::new(|_cancel: CancellationToken| async { Err::<(), _>(anyhow::anyhow!("no upstream")) });
        let (rx, _handle) = spawn_task(task, CancellationToken::new());

        match rx.await.unwrap() {
            Err(TaskError::Failed(e)) => assert_eq!(e.to_string(), "no upstream"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_is_recovered() {
        fn explode() -> anyhow::Result<()> {
            panic!("task blew up")
        }

        let task: Arc<dyn LeaderTask> = Arc::new(|_cancel: CancellationToken| async { explode() });
        let (rx, handle) = spawn_task(task, CancellationToken::new());

        match rx.await.unwrap() {
            Err(TaskError::Panicked(p)) => assert_eq!(p.message(), "task blew up"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        // The unit itself finished normally
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_task_observes_cancellation() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let task: Arc<dyn LeaderTask> = Arc::new(move |cancel: CancellationToken| {
            let flag = flag.clone();
            async move {
                cancel.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        });

        let cancel = CancellationToken::new();
        let (rx, _handle) = spawn_task(task, cancel.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!stopped.load(Ordering::SeqCst));

        cancel.cancel();
        assert!(matches!(rx.await, Ok(Ok(()))));
        assert!(stopped.load(Ordering::SeqCst));
    }
}
