//! Lease renewal unit
//!
//! Refreshes the lease every renewal interval, starting one interval after
//! acquisition. The first failed refresh is reported once and the unit stops;
//! a healthy unit never sends anything. A panic inside `refresh` counts as a
//! failed refresh.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument, Span};

use crate::error::{LockError, RecoveredPanic};
use crate::lock::Lease;

pub(crate) fn spawn_renewal(
    lease: Arc<dyn Lease>,
    ttl: Duration,
    every: Duration,
    cancel: CancellationToken,
) -> (oneshot::Receiver<LockError>, JoinHandle<()>) {
    let (tx, rx) = oneshot::channel();

    let handle = tokio::spawn(
        async move {
            let result = AssertUnwindSafe(renew_until_failure(lease.as_ref(), ttl, every, &cancel))
                .catch_unwind()
                .await;

            let failure = match result {
                Ok(failure) => failure,
                Err(payload) => {
                    let panic = RecoveredPanic::from_payload(payload);
                    warn!(key = %lease.key(), error = %panic, "Lease refresh panicked, ending leadership");
                    Some(LockError::Backend(format!("lease refresh panicked: {}", panic.message())))
                }
            };

            if let Some(e) = failure {
                let _ = tx.send(e);
            }
        }
        .instrument(Span::current()),
    );

    (rx, handle)
}

/// Returns the refresh error, or `None` once cancelled.
async fn renew_until_failure(
    lease: &dyn Lease,
    ttl: Duration,
    every: Duration,
    cancel: &CancellationToken,
) -> Option<LockError> {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = lease.refresh(ttl) => result,
        };

        match result {
            Ok(()) => {
                debug!(key = %lease.key(), "Lease extended");
            }
            Err(e) => {
                warn!(key = %lease.key(), error = %e, "Lease can not be extended, ending leadership");
                return Some(e);
            }
        }
    }
}
