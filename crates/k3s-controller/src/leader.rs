//! Single active instance coordination through a `coordination.k8s.io/v1` Lease.
//!
//! Only the lease holder reconciles. Losing the lease is fatal: the caller
//! gets [`Error::LeadershipLost`] and is expected to exit.
use std::future::Future;
use std::time::Duration;

use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::{Error, Result};

/// How long a lease stays valid without renewal.
pub const LEASE_DURATION: Duration = Duration::from_secs(15);
/// How long the holder keeps trying to renew before giving up. Strictly
/// shorter than [`LEASE_DURATION`] so we stop before a standby can take over.
pub const RENEW_DEADLINE: Duration = Duration::from_secs(10);
/// How often the holder renews.
pub const RENEW_PERIOD: Duration = Duration::from_secs(5);
/// How often a standby instance checks whether the lease became free.
pub const RETRY_PERIOD: Duration = Duration::from_secs(2);

/// A named lease held on behalf of one process identity.
pub struct Leadership {
    lock: LeaseLock,
    name: String,
    identity: String,
}

impl Leadership {
    pub fn new(client: kube::Client, namespace: &str, name: &str, identity: &str) -> Self {
        let lock = LeaseLock::new(
            client,
            namespace,
            LeaseLockParams {
                lease_name: name.to_string(),
                holder_id: identity.to_string(),
                lease_ttl: LEASE_DURATION,
            },
        );
        Leadership {
            lock,
            name: name.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Acquires or renews the lease. `Ok(false)` means another instance
    /// holds it.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        Ok(self.lock.try_acquire_or_renew().await?.acquired_lease)
    }

    /// Gives up the lease so a standby can take over immediately.
    pub async fn release(&self) -> Result<()> {
        Ok(self.lock.step_down().await?)
    }
}

/// Runs `start` only while holding `leadership`.
///
/// Waits for the lease (retrying errors with backoff), then runs `start`
/// while renewing in the background. Returns when `start` finishes, when
/// `shutdown` resolves (releasing the lease), or with
/// [`Error::LeadershipLost`] when the lease could not be kept.
pub async fn run_while_leader<S, F, Fut>(
    leadership: Leadership,
    shutdown: S,
    start: F,
) -> Result<()>
where
    S: Future<Output = ()>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    tokio::pin!(shutdown);
    let mut backoff = Backoff::default();

    loop {
        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            acquired = leadership.try_acquire_or_renew() => match acquired {
                Ok(true) => break,
                Ok(false) => {
                    debug!(lease = %leadership.name, "Lease held by another instance");
                    backoff.reset();
                    tokio::time::sleep(RETRY_PERIOD).await;
                }
                Err(e) => {
                    warn!(lease = %leadership.name, error = %e, "Failed to acquire lease, retrying");
                    backoff.wait().await;
                }
            }
        }
    }
    info!(lease = %leadership.name, identity = %leadership.identity, "Acquired leadership");

    let renewal = keep_renewed(&leadership.name, || leadership.try_acquire_or_renew());
    let result = tokio::select! {
        result = start() => result,
        lost = renewal => Err(lost),
        _ = &mut shutdown => {
            info!(lease = %leadership.name, "Shutting down, releasing lease");
            Ok(())
        }
    };

    if !matches!(result, Err(Error::LeadershipLost(_))) {
        if let Err(e) = leadership.release().await {
            warn!(lease = %leadership.name, error = %e, "Unable to release lease");
        }
    }
    result
}

/// Time left to renew, given how long ago the last renewal succeeded.
fn renew_budget(since_renewed: Duration) -> Option<Duration> {
    RENEW_DEADLINE
        .checked_sub(since_renewed)
        .filter(|left| !left.is_zero())
}

/// Renews every [`RENEW_PERIOD`] until the lease is lost; resolves to the
/// error describing the loss. Failed attempts are retried every
/// [`RETRY_PERIOD`], and every attempt is cut off at the renew deadline so a
/// hanging request cannot outlive the lease.
async fn keep_renewed<R, Fut>(lease: &str, mut renew: R) -> Error
where
    R: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut last_renewed = Instant::now();
    let mut wait = RENEW_PERIOD;
    loop {
        tokio::time::sleep(wait).await;
        let budget = match renew_budget(last_renewed.elapsed()) {
            Some(budget) => budget,
            None => return Error::LeadershipLost(lease.to_string()),
        };
        match tokio::time::timeout(budget, renew()).await {
            Ok(Ok(true)) => {
                last_renewed = Instant::now();
                wait = RENEW_PERIOD;
                continue;
            }
            Ok(Ok(false)) => return Error::LeadershipLost(lease.to_string()),
            Ok(Err(e)) => warn!(%lease, error = %e, "Failed to renew lease"),
            Err(_) => warn!(%lease, "Lease renewal timed out"),
        }
        wait = RETRY_PERIOD;
    }
}
