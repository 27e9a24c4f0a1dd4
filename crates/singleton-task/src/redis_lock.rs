//! Redis-backed lock service
//!
//! Implements leases on top of plain Redis keys:
//! - SET NX with millisecond expiry for atomic acquisition
//! - Lua check-and-PEXPIRE to extend a lease we still own
//! - Lua check-and-DEL to release it
//!
//! Each lease carries a random token so a client can never extend or delete a
//! key that has since been taken over by another holder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::LockError;
use crate::lock::{Lease, LockService};

const REFRESH_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("PEXPIRE", KEYS[1], ARGV[2])
    else
        return 0
    end
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

/// Lock service client backed by a Redis connection.
///
/// `close` marks this client as closed: every later call on the client or on
/// leases it handed out fails with `LockError::Closed`.
#[derive(Clone)]
pub struct RedisLockService {
    conn: ConnectionManager,
    closed: Arc<AtomicBool>,
}

impl RedisLockService {
    /// Connect to Redis at `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(redis_url = %redis_url, "Connected lock service to Redis");

        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Redis lock service closed");
        }
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
impl LockService for RedisLockService {
    async fn obtain(&self, key: &str, ttl: Duration) -> Result<Box<dyn Lease>, LockError> {
        self.ensure_open()?;

        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();

        // SET key token NX PX milliseconds
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        if result.is_none() {
            return Err(LockError::NotObtained);
        }

        Ok(Box::new(RedisLease {
            client: self.clone(),
            key: key.to_string(),
            token,
        }))
    }
}

/// A lease held on a Redis key.
pub struct RedisLease {
    client: RedisLockService,
    key: String,
    token: String,
}

#[async_trait]
impl Lease for RedisLease {
    fn key(&self) -> &str {
        &self.key
    }

    async fn refresh(&self, ttl: Duration) -> Result<(), LockError> {
        self.client.ensure_open()?;

        let mut conn = self.client.conn.clone();
        let extended: i32 = redis::Script::new(REFRESH_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        if extended == 1 {
            Ok(())
        } else {
            Err(LockError::LeaseLost)
        }
    }

    async fn release(&self) -> Result<(), LockError> {
        self.client.ensure_open()?;

        let mut conn = self.client.conn.clone();
        let deleted: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 1 {
            Ok(())
        } else {
            Err(LockError::LeaseLost)
        }
    }
}

/// Redis rejects a zero PX, so anything below a millisecond rounds up.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
