//! Lock service abstraction
//!
//! The engine only needs three operations from a lock service: obtain a lease
//! for a key, refresh it, and release it. Backends live in `redis_lock` and
//! `memory_lock`.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::LockError;

/// A service that grants time-bounded exclusive leases on keys.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to obtain the lease for `key`.
    ///
    /// Returns `LockError::NotObtained` when another holder owns the key and
    /// `LockError::Closed` once the client can no longer talk to the service.
    async fn obtain(&self, key: &str, ttl: Duration) -> Result<Box<dyn Lease>, LockError>;
}

/// A lease held on a key.
#[async_trait]
pub trait Lease: Send + Sync {
    /// The key this lease is held on.
    fn key(&self) -> &str;

    /// Extend the lease so it expires `ttl` from now.
    async fn refresh(&self, ttl: Duration) -> Result<(), LockError>;

    /// Give the lease up. Best-effort: if this fails the lease expires on its own.
    async fn release(&self) -> Result<(), LockError>;
}
