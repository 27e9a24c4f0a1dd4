//! Singleton task controller
//!
//! Public handle over the election loop. Owns the root cancellation token,
//! starts the loop, and shuts it down exactly once whether that is asked for
//! explicitly, by the lock service going away, or by the caller's parent token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument, Span};
use uuid::Uuid;

use crate::election::run_election;
use crate::error::{Result, SingletonError};
use crate::lock::LockService;
use crate::task::LeaderTask;

/// Renewal happens three times per TTL.
const RENEWALS_PER_TTL: u32 = 3;

/// Options for a singleton task
#[derive(Debug, Clone)]
pub struct SingletonOptions {
    /// Coordination key; every process contending for the same key runs the task at most once at a time
    pub key: String,

    /// Lease TTL
    pub ttl: Duration,

    /// Delay between contended or failed acquisitions (defaults to the renewal interval)
    pub retry_interval: Option<Duration>,

    /// How long a cancelled task may keep running before the lease is released anyway
    /// (defaults to the renewal interval)
    pub drain_timeout: Option<Duration>,

    /// Host identity attached to log events
    pub host: String,

    /// Unique identifier for this instance
    pub instance_id: String,
}

impl SingletonOptions {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
            retry_interval: None,
            drain_timeout: None,
            host: "unknown".to_string(),
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    pub fn renewal_interval(&self) -> Duration {
        self.ttl / RENEWALS_PER_TTL
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval.unwrap_or_else(|| self.renewal_interval())
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout.unwrap_or_else(|| self.renewal_interval())
    }

    pub fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(SingletonError::Config("key must not be empty".to_string()));
        }
        if self.renewal_interval().is_zero() {
            return Err(SingletonError::Config(format!(
                "ttl {:?} is too short to renew",
                self.ttl
            )));
        }
        if self.retry_interval().is_zero() {
            return Err(SingletonError::Config(
                "retry interval must be greater than zero".to_string(),
            ));
        }
        if self.drain_timeout().is_zero() {
            return Err(SingletonError::Config(
                "drain timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Leadership status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipStatus {
    /// No acquisition has completed yet, or the last one hit an unexpected error
    Unknown,
    /// Another instance holds the lease
    Follower,
    /// This instance holds the lease and is running the task
    Leader,
    /// The election loop has exited for good
    Stopped,
}

/// State shared between the controller, its watcher, and the election loop.
pub(crate) struct Shared {
    pub(crate) options: SingletonOptions,
    pub(crate) lock: Arc<dyn LockService>,
    pub(crate) task: Arc<dyn LeaderTask>,
    parent: CancellationToken,
    pub(crate) root: CancellationToken,
    closed: AtomicBool,
    status_tx: watch::Sender<LeadershipStatus>,
}

impl Shared {
    /// Returns `true` for the call that actually closed.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Closing singleton task");
        self.root.cancel();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.root.is_cancelled()
    }

    pub(crate) fn set_status(&self, status: LeadershipStatus) {
        let _ = self.status_tx.send(status);
    }

    fn span(&self) -> Span {
        info_span!(
            "singleton",
            key = %self.options.key,
            host = %self.options.host,
            id = %self.options.instance_id,
        )
    }
}

/// Runs a task on exactly one process at a time across everyone sharing a key.
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use singleton_task::{MemoryLockStore, SingletonTask};
/// use tokio_util::sync::CancellationToken;
///
/// async fn example() {
///     let store = MemoryLockStore::new();
///     let singleton = SingletonTask::new(
///         Arc::new(store.client()),
///         "reports:nightly",
///         |cancel: CancellationToken| async move {
///             cancel.cancelled().await;
///             anyhow::Ok(())
///         },
///         CancellationToken::new(),
///         Duration::from_secs(30),
///     );
///
///     singleton.start().unwrap();
///     // ...
///     singleton.shutdown().await;
/// }
/// ```
pub struct SingletonTask {
    shared: Arc<Shared>,
    status_rx: watch::Receiver<LeadershipStatus>,
    started: AtomicBool,
    election: Mutex<Option<JoinHandle<()>>>,
}

impl SingletonTask {
    /// Create a controller with default options for `key` and `ttl`.
    ///
    /// Cancelling `parent` closes the controller.
    pub fn new<T: LeaderTask>(
        lock: Arc<dyn LockService>,
        key: impl Into<String>,
        task: T,
        parent: CancellationToken,
        ttl: Duration,
    ) -> Self {
        Self::with_options(lock, task, parent, SingletonOptions::new(key, ttl))
    }

    pub fn with_options<T: LeaderTask>(
        lock: Arc<dyn LockService>,
        task: T,
        parent: CancellationToken,
        options: SingletonOptions,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(LeadershipStatus::Unknown);
        let root = parent.child_token();

        Self {
            shared: Arc::new(Shared {
                options,
                lock,
                task: Arc::new(task),
                parent,
                root,
                closed: AtomicBool::new(false),
                status_tx,
            }),
            status_rx,
            started: AtomicBool::new(false),
            election: Mutex::new(None),
        }
    }

    /// Spawn the election loop on the current tokio runtime and return immediately.
    ///
    /// Fails only on misuse: invalid options, no runtime, a second start, or a
    /// controller that is already closed.
    pub fn start(&self) -> Result<()> {
        self.shared.options.validate()?;

        if self.shared.is_closed() {
            return Err(SingletonError::Closed);
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SingletonError::NoRuntime)?;

        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SingletonError::AlreadyStarted);
        }

        let span = self.shared.span();
        span.in_scope(|| {
            info!(
                ttl_ms = self.shared.options.ttl.as_millis() as u64,
                renewal_interval_ms = self.shared.options.renewal_interval().as_millis() as u64,
                "Starting singleton task"
            )
        });

        // Parent watcher: explicit close and parent cancellation end up on the same path
        let shared = self.shared.clone();
        runtime.spawn(
            async move {
                tokio::select! {
                    _ = shared.parent.cancelled() => {
                        debug!("Parent token cancelled");
                    }
                    _ = shared.root.cancelled() => {}
                }
                shared.close();
            }
            .instrument(span.clone()),
        );

        let election = runtime.spawn(run_election(self.shared.clone()).instrument(span));
        *self.election.lock() = Some(election);

        Ok(())
    }

    /// Stop contending and cancel any running task. Only the first call has an effect.
    pub fn close(&self) -> Result<()> {
        self.shared.close();
        Ok(())
    }

    /// Close and wait for the election loop, including any in-flight attempt and
    /// its lease release, to finish.
    pub async fn shutdown(&self) {
        self.shared.close();

        let handle = self.election.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Check if this instance is currently the leader
    pub fn is_leader(&self) -> bool {
        self.status() == LeadershipStatus::Leader
    }

    pub fn status(&self) -> LeadershipStatus {
        *self.status_rx.borrow()
    }

    /// Subscribe to leadership status changes
    pub fn subscribe(&self) -> watch::Receiver<LeadershipStatus> {
        self.status_rx.clone()
    }

    /// Wait until this instance becomes the leader.
    ///
    /// Returns `false` if the election loop stops first.
    pub async fn wait_for_leadership(&self) -> bool {
        let mut rx = self.subscribe();

        loop {
            match *rx.borrow_and_update() {
                LeadershipStatus::Leader => return true,
                LeadershipStatus::Stopped => return false,
                _ => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Wait until the election loop has exited, whatever the reason.
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|status| *status == LeadershipStatus::Stopped).await;
    }

    pub fn key(&self) -> &str {
        &self.shared.options.key
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.options.instance_id
    }

    pub fn options(&self) -> &SingletonOptions {
        &self.shared.options
    }
}

impl Drop for SingletonTask {
    fn drop(&mut self) {
        self.shared.close();
    }
}
