//! Singleton Task
//!
//! Runs a long-lived task on exactly one process at a time across a fleet that
//! shares a coordination key, with automatic failover when the leader goes away.
//!
//! # Features
//!
//! - **Lease-based election**: a renewable TTL lease from an external lock service
//! - **Heartbeat**: the lease is refreshed every `ttl / 3` while the task runs
//! - **Failover**: losing the lease cancels the task; another process takes over
//! - **Fault isolation**: task errors and panics end the attempt, never the process
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use singleton_task::{RedisLockService, SingletonOptions, SingletonTask};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example() {
//!     let lock = Arc::new(RedisLockService::connect("redis://localhost:6379").await.unwrap());
//!
//!     let options = SingletonOptions::new("billing:reconciler", Duration::from_secs(30))
//!         .with_host("worker-1");
//!
//!     let singleton = SingletonTask::with_options(
//!         lock,
//!         |cancel: CancellationToken| async move {
//!             while !cancel.is_cancelled() {
//!                 // Do one unit of work
//!                 tokio::time::sleep(Duration::from_secs(1)).await;
//!             }
//!             anyhow::Ok(())
//!         },
//!         CancellationToken::new(),
//!         options,
//!     );
//!
//!     singleton.start().unwrap();
//!
//!     // Only the leader runs the task; everyone else waits for the lease
//!     singleton.wait_for_leadership().await;
//!
//!     singleton.shutdown().await;
//! }
//! ```

mod attempt;
mod election;
mod error;
mod lock;
mod memory_lock;
mod redis_lock;
mod renewal;
mod singleton;
mod task;

pub use error::{LockError, RecoveredPanic, Result, SingletonError, TaskError};
pub use lock::{Lease, LockService};
pub use memory_lock::{MemoryLease, MemoryLockClient, MemoryLockStore};
pub use redis_lock::{RedisLease, RedisLockService};
pub use singleton::{LeadershipStatus, SingletonOptions, SingletonTask};
pub use task::LeaderTask;
