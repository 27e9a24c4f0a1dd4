//! Singleton Runner
//!
//! Competes for the configured key and, while leader, logs a heartbeat every
//! renewal interval. Start several copies against the same Redis to watch
//! failover happen.

use std::sync::Arc;
use std::time::Duration;

use singleton_config::{AppConfig, SingletonConfig};
use singleton_task::{LeadershipStatus, RedisLockService, SingletonOptions, SingletonTask};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn build_options(config: &SingletonConfig, host: String) -> SingletonOptions {
    let mut options = SingletonOptions::new(config.key.clone(), config.ttl()).with_host(host);
    if let Some(interval) = config.retry_interval() {
        options = options.with_retry_interval(interval);
    }
    if let Some(timeout) = config.drain_timeout() {
        options = options.with_drain_timeout(timeout);
    }
    if let Some(id) = config.instance_id() {
        options = options.with_instance_id(id);
    }
    options
}

async fn heartbeat(cancel: CancellationToken, every: Duration) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(every);
    let mut beats: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(beats, "Heartbeat stopping");
                return Ok(());
            }
            _ = ticker.tick() => {
                beats += 1;
                info!(beats, "Heartbeat");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    singleton_common::logging::init_logging("singleton-runner");

    info!("Starting singleton runner");

    let config = AppConfig::load()?;
    let options = build_options(&config.singleton, singleton_common::hostname());
    info!(
        key = %options.key,
        ttl_ms = config.singleton.ttl_ms,
        renewal_interval_ms = options.renewal_interval().as_millis() as u64,
        "Singleton configuration loaded"
    );

    let lock = Arc::new(RedisLockService::connect(&config.redis.url).await?);
    info!(url = %config.redis.url, "Connected to Redis");

    let every = options.renewal_interval();
    let shutdown = CancellationToken::new();
    let singleton = SingletonTask::with_options(
        lock.clone(),
        move |cancel: CancellationToken| heartbeat(cancel, every),
        shutdown.clone(),
        options,
    );
    singleton.start()?;
    info!(
        key = %singleton.key(),
        instance_id = %singleton.instance_id(),
        host = %singleton.options().host,
        "Competing for leadership"
    );

    let mut status = singleton.subscribe();
    let status_logger = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!(status = ?current, "Leadership status changed");
            if current == LeadershipStatus::Stopped {
                break;
            }
        }
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received");
        }
        _ = singleton.wait_until_stopped() => {
            warn!("Election stopped on its own, exiting");
        }
    }

    shutdown.cancel();
    singleton.shutdown().await;
    lock.close();
    let _ = status_logger.await;

    info!("Singleton runner stopped");
    Ok(())
}
