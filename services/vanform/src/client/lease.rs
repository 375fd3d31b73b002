//! Lease Watcher
//!
//! Periodically renews the session token until renewal fails or the lease
//! can no longer be extended (max TTL reached).

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::vault::{AuthBackend, AuthLease};
use crate::error::StoreError;

/// Lease increment requested on every renewal (seconds)
pub const DEFAULT_RENEW_INCREMENT: u64 = 3600;

/// Watcher notifications
#[derive(Debug)]
pub enum WatcherEvent {
    /// The lease was extended
    Renewed {
        at: DateTime<Utc>,
        lease_duration: u64,
    },
    /// The watcher has finished. `Ok` means the lease reached its maximum
    /// lifetime; `Err` carries the final renewal failure.
    Done(Result<(), StoreError>),
}

pub struct LeaseWatcher {
    backend: Arc<dyn AuthBackend>,
    client_token: String,
    lease_duration: u64,
    increment: u64,
    grace: Duration,
    finished: bool,
}

impl LeaseWatcher {
    pub fn new(backend: Arc<dyn AuthBackend>, lease: &AuthLease, increment: u64) -> Self {
        Self {
            backend,
            client_token: lease.client_token.clone(),
            lease_duration: lease.lease_duration,
            increment,
            grace: grace_period(lease.lease_duration),
            finished: false,
        }
    }

    /// Wait for the next renewal and report its result.
    ///
    /// Once `Done` has been returned, further calls never resolve.
    pub async fn next(&mut self) -> WatcherEvent {
        if self.finished {
            return std::future::pending().await;
        }

        tokio::time::sleep(renew_after(self.lease_duration)).await;

        let lease = match self
            .backend
            .renew_self(&self.client_token, self.increment)
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                self.finished = true;
                return WatcherEvent::Done(Err(e));
            }
        };

        let shrinking = lease.lease_duration < self.lease_duration
            && Duration::from_secs(lease.lease_duration) <= self.grace;
        if !lease.renewable || lease.lease_duration == 0 || shrinking {
            debug!(
                lease_duration = lease.lease_duration,
                "lease is no longer being extended, waiting for expiry"
            );
            self.finished = true;
            tokio::time::sleep(Duration::from_secs(lease.lease_duration)).await;
            return WatcherEvent::Done(Ok(()));
        }

        self.lease_duration = lease.lease_duration;
        WatcherEvent::Renewed {
            at: Utc::now(),
            lease_duration: lease.lease_duration,
        }
    }
}

/// Remaining lease below which a non-growing lease counts as exhausted
fn grace_period(lease_duration: u64) -> Duration {
    Duration::from_secs((lease_duration / 10).max(1))
}

/// Two thirds of the lease, minus up to 10% jitter
fn renew_after(lease_duration: u64) -> Duration {
    let base = lease_duration as f64 * 2.0 / 3.0;
    let jitter: f64 = rand::thread_rng().gen_range(0.0..0.1);
    Duration::from_secs_f64(base * (1.0 - jitter))
}
