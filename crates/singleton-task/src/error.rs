//! Error types for the singleton task engine

use std::any::Any;
use std::error::Error as StdError;

use thiserror::Error;

/// Errors reported by a lock service or one of its leases.
#[derive(Error, Debug)]
pub enum LockError {
    /// Another holder owns the key.
    #[error("Lock not obtained")]
    NotObtained,

    /// The lease is no longer held by this client (expired or taken over).
    #[error("Lease is no longer held")]
    LeaseLost,

    /// The client was closed; no further calls can succeed.
    #[error("Lock service client is closed")]
    Closed,

    #[error("Lock service error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for LockError {
    fn from(e: redis::RedisError) -> Self {
        LockError::Backend(e.to_string())
    }
}

/// A panic caught at the task boundary.
///
/// When the panic payload is itself an error value it is kept as the source.
#[derive(Error, Debug)]
#[error("Task panicked: {message}")]
pub struct RecoveredPanic {
    message: String,
    #[source]
    cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl RecoveredPanic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// Build from the payload handed back by `catch_unwind`.
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<&'static str>() {
            Ok(msg) => return Self::new(*msg),
            Err(other) => other,
        };
        let payload = match payload.downcast::<String>() {
            Ok(msg) => return Self::new(*msg),
            Err(other) => other,
        };
        let payload = match payload.downcast::<anyhow::Error>() {
            Ok(err) => {
                return Self {
                    message: format!("{:#}", err),
                    cause: Some((*err).into()),
                }
            }
            Err(other) => other,
        };
        match payload.downcast::<Box<dyn StdError + Send + Sync>>() {
            Ok(err) => Self {
                message: err.to_string(),
                cause: Some(*err),
            },
            Err(_) => Self::new("panic with a non-string payload"),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Why the task execution unit finished with a failure.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Task returned an error: {0:#}")]
    Failed(anyhow::Error),

    #[error(transparent)]
    Panicked(#[from] RecoveredPanic),
}

/// Errors surfaced by the public `SingletonTask` API.
///
/// Only local misuse is reported here; coordination failures stay inside the
/// election loop and are logged.
#[derive(Error, Debug)]
pub enum SingletonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No tokio runtime available to spawn the election loop")]
    NoRuntime,

    #[error("Already running")]
    AlreadyStarted,

    #[error("Singleton task is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SingletonError>;
