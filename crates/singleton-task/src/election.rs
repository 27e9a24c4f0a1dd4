//! Election loop
//!
//! Keeps trying to obtain the lease until the controller closes:
//! - lease obtained: run one leadership attempt, then retry straight away
//! - held elsewhere, or unexpected error: wait one retry interval
//! - lock service closed: close the controller and stop for good
//!
//! Close interrupts an acquire that is still in flight.

use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::attempt::{AttemptOutcome, AttemptTiming, LeadershipAttempt};
use crate::error::{LockError, TaskError};
use crate::lock::Lease;
use crate::singleton::{LeadershipStatus, Shared};

pub(crate) async fn run_election(shared: Arc<Shared>) {
    let options = &shared.options;
    let timing = AttemptTiming {
        ttl: options.ttl,
        renewal_interval: options.renewal_interval(),
        drain_timeout: options.drain_timeout(),
    };
    let mut attempt: u64 = 0;

    while !shared.root.is_cancelled() {
        // A hung acquire must not hold up close; anything it still grants expires by ttl
        let obtained = tokio::select! {
            result = shared.lock.obtain(&options.key, options.ttl) => result,
            _ = shared.root.cancelled() => {
                debug!("Closed while acquiring the lease");
                break;
            }
        };

        match obtained {
            Ok(lease) => {
                if shared.root.is_cancelled() {
                    // Closed while the request was in flight
                    release_unused(lease.as_ref()).await;
                    break;
                }

                attempt += 1;
                let span = info_span!("attempt", attempt);

                async {
                    info!("Acquired leadership");
                    shared.set_status(LeadershipStatus::Leader);

                    let outcome = LeadershipAttempt::new(lease, shared.root.child_token(), timing)
                        .run(shared.task.clone())
                        .await;

                    log_outcome(&outcome);
                    shared.set_status(LeadershipStatus::Follower);
                }
                .instrument(span)
                .await;
            }
            Err(LockError::NotObtained) => {
                debug!("Leadership held by another instance");
                shared.set_status(LeadershipStatus::Follower);
                backoff(&shared).await;
            }
            Err(LockError::Closed) => {
                if shared.close() {
                    warn!("Lock service closed, giving up on leadership");
                }
                break;
            }
            Err(e) => {
                error!(error = %e, "Unexpected error from lock service");
                shared.set_status(LeadershipStatus::Unknown);
                backoff(&shared).await;
            }
        }
    }

    shared.set_status(LeadershipStatus::Stopped);
    info!(attempts = attempt, "Election loop stopped");
}

/// Wait one retry interval, cut short by close.
async fn backoff(shared: &Shared) {
    tokio::select! {
        _ = shared.root.cancelled() => {}
        _ = tokio::time::sleep(shared.options.retry_interval()) => {}
    }
}

async fn release_unused(lease: &dyn Lease) {
    if let Err(e) = lease.release().await {
        warn!(error = %e, "Failed to release lease obtained during shutdown");
    }
}

fn log_outcome(outcome: &AttemptOutcome) {
    match outcome {
        AttemptOutcome::Completed => info!("Task completed, leadership released"),
        AttemptOutcome::Cancelled => info!("Leadership attempt cancelled"),
        AttemptOutcome::RenewalFailed(e) => warn!(error = %e, "Lost leadership"),
        AttemptOutcome::TaskFailed(TaskError::Panicked(p)) => {
            error!(error = %p, "Recovered from task panic")
        }
        AttemptOutcome::TaskFailed(e) => error!(error = %e, "Task failed"),
    }
}
