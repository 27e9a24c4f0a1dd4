//! In-process lock service
//!
//! A lock table shared by any number of clients in the same process. Expiry is
//! measured on `tokio::time::Instant`, so leases behave correctly under a paused
//! test clock. Each client can be closed on its own to simulate a dropped
//! connection while other clients keep working.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::LockError;
use crate::lock::{Lease, LockService};

#[derive(Debug)]
struct Entry {
    token: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Shared lock table.
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryLockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create an independent client on this store.
    pub fn client(self: &Arc<Self>) -> MemoryLockClient {
        MemoryLockClient {
            store: Arc::clone(self),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether anyone currently holds an unexpired lease on `key`.
    pub fn is_held(&self, key: &str) -> bool {
        let entries = self.entries.lock();
        entries
            .get(key)
            .map(|e| e.is_live(Instant::now()))
            .unwrap_or(false)
    }

    fn try_insert(&self, key: &str, token: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get(key) {
            if existing.is_live(now) {
                return false;
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        true
    }

    fn extend(&self, key: &str, token: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if entry.token == token && entry.is_live(now) => {
                entry.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    fn remove(&self, key: &str, token: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.token == token => {
                let live = entry.is_live(now);
                entries.remove(key);
                live
            }
            _ => false,
        }
    }
}

/// A client connection to a `MemoryLockStore`.
#[derive(Clone)]
pub struct MemoryLockClient {
    store: Arc<MemoryLockStore>,
    closed: Arc<AtomicBool>,
}

impl MemoryLockClient {
    /// Close this client. Leases it holds are left to expire.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), LockError> {
        if self.is_closed() {
            Err(LockError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LockService for MemoryLockClient {
    async fn obtain(&self, key: &str, ttl: Duration) -> Result<Box<dyn Lease>, LockError> {
        self.ensure_open()?;

        let token = Uuid::new_v4().to_string();
        if !self.store.try_insert(key, &token, ttl) {
            return Err(LockError::NotObtained);
        }

        Ok(Box::new(MemoryLease {
            client: self.clone(),
            key: key.to_string(),
            token,
        }))
    }
}

pub struct MemoryLease {
    client: MemoryLockClient,
    key: String,
    token: String,
}

#[async_trait]
impl Lease for MemoryLease {
    fn key(&self) -> &str {
        &self.key
    }

    async fn refresh(&self, ttl: Duration) -> Result<(), LockError> {
        self.client.ensure_open()?;

        if self.client.store.extend(&self.key, &self.token, ttl) {
            Ok(())
        } else {
            Err(LockError::LeaseLost)
        }
    }

    async fn release(&self) -> Result<(), LockError> {
        self.client.ensure_open()?;

        if self.client.store.remove(&self.key, &self.token) {
            Ok(())
        } else {
            Err(LockError::LeaseLost)
        }
    }
}
