//! Service registrar
//!
//! Registers a server address under `"<service>/" + schemeAddress` bound to a
//! lease, and keeps the lease alive from a background task. The key lives
//! exactly as long as the lease: release revokes it for prompt removal, and
//! a process that stops renewing disappears once the TTL runs out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::discovery::Address;
use crate::error::{Error, Result};
use crate::store::{CoordinationStore, LeaseId, StoreError};

// ============================================================================
// Lease Handle
// ============================================================================

/// A granted lease and the key bound to it
#[derive(Debug, Clone)]
pub struct LeaseHandle {
    pub lease_id: LeaseId,

    /// TTL as granted by the store
    pub ttl: Duration,

    /// Registered address
    pub owner: Address,

    /// Store key written for `owner`
    pub key: String,

    pub granted_at: DateTime<Utc>,
}

impl LeaseHandle {
    /// Interval between keepalive renewals
    ///
    /// A third of the TTL, so two renewals may fail before the lease lapses.
    pub fn keepalive_interval(&self) -> Duration {
        (self.ttl / 3).max(Duration::from_millis(100))
    }
}

// ============================================================================
// Registrar
// ============================================================================

/// Registers service instances in a coordination store
#[derive(Clone)]
pub struct Registrar {
    store: Arc<dyn CoordinationStore>,
    scheme: String,
}

impl Registrar {
    /// Create a registrar writing keys with `scheme`
    pub fn new(store: Arc<dyn CoordinationStore>, scheme: impl Into<String>) -> Self {
        Self {
            store,
            scheme: scheme.into(),
        }
    }

    /// Register `address` under `service` with a lease of `ttl`
    ///
    /// Fails with `StoreUnavailable` when the store cannot be reached and
    /// `LeaseGrantFailed` when the lease request is rejected.
    pub async fn register(
        &self,
        service: &str,
        address: Address,
        ttl: Duration,
    ) -> Result<Registration> {
        let grant = self.store.grant_lease(ttl).await.map_err(|e| match e {
            StoreError::Unavailable(msg) => Error::StoreUnavailable(msg),
            other => Error::LeaseGrantFailed(other.to_string()),
        })?;

        let key = address.store_key(service, &self.scheme);
        if let Err(e) = self
            .store
            .put(&key, &grant.id.to_string(), Some(grant.id))
            .await
        {
            // Don't leave an orphaned lease behind
            if let Err(revoke_err) = self.store.revoke_lease(grant.id).await {
                tracing::debug!(lease_id = grant.id, "Revoke after failed put: {revoke_err}");
            }
            return Err(e.into());
        }

        let lease = LeaseHandle {
            lease_id: grant.id,
            ttl: grant.ttl,
            owner: address,
            key,
            granted_at: Utc::now(),
        };

        tracing::info!(
            service = %service,
            key = %lease.key,
            lease_id = lease.lease_id,
            ttl_secs = lease.ttl.as_secs(),
            "Registered service instance"
        );

        Ok(Registration::start(Arc::clone(&self.store), lease))
    }

    /// Revoke a registration's lease
    pub async fn release(&self, registration: Registration) -> Result<()> {
        registration.release().await
    }
}

// ============================================================================
// Registration
// ============================================================================

/// A live registration with its keepalive task
///
/// Dropping a registration stops renewals without revoking; the key then
/// expires with the lease.
pub struct Registration {
    lease: LeaseHandle,
    store: Arc<dyn CoordinationStore>,
    shutdown: watch::Sender<bool>,
    keepalive: JoinHandle<()>,
    renewals: Arc<AtomicU64>,
}

impl Registration {
    fn start(store: Arc<dyn CoordinationStore>, lease: LeaseHandle) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let renewals = Arc::new(AtomicU64::new(0));
        let keepalive = tokio::spawn(keepalive_loop(
            Arc::clone(&store),
            lease.clone(),
            Arc::clone(&renewals),
            shutdown_rx,
        ));

        Self {
            lease,
            store,
            shutdown,
            keepalive,
            renewals,
        }
    }

    pub fn lease(&self) -> &LeaseHandle {
        &self.lease
    }

    /// Whether the keepalive task is still running
    pub fn keepalive_running(&self) -> bool {
        !self.keepalive.is_finished()
    }

    /// Successful renewals so far
    pub fn renewal_count(&self) -> u64 {
        self.renewals.load(Ordering::Relaxed)
    }

    async fn stop_keepalive(&mut self) {
        let _ = self.shutdown.send(true);
        let _ = (&mut self.keepalive).await;
    }

    /// Stop renewing without revoking, as an abnormal exit would
    pub async fn abandon(mut self) {
        self.stop_keepalive().await;
        tracing::warn!(
            key = %self.lease.key,
            lease_id = self.lease.lease_id,
            "Registration abandoned; key expires with its lease"
        );
    }

    /// Stop renewing and revoke the lease, deleting the key
    pub async fn release(mut self) -> Result<()> {
        self.stop_keepalive().await;
        self.store.revoke_lease(self.lease.lease_id).await?;
        tracing::info!(
            key = %self.lease.key,
            lease_id = self.lease.lease_id,
            "Released registration"
        );
        Ok(())
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.keepalive.abort();
    }
}

async fn keepalive_loop(
    store: Arc<dyn CoordinationStore>,
    lease: LeaseHandle,
    renewals: Arc<AtomicU64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let period = lease.keepalive_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    // A slow renewal must not be followed by a burst of catch-up renewals
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.keep_alive(lease.lease_id).await {
                    Ok(ttl) => {
                        renewals.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(lease_id = lease.lease_id, ttl_secs = ttl.as_secs(), "Lease renewed");
                    }
                    Err(e) => {
                        let err = Error::LeaseRenewalFailed {
                            lease_id: lease.lease_id,
                            reason: e.to_string(),
                        };
                        tracing::warn!(key = %lease.key, "{err}");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                tracing::debug!(lease_id = lease.lease_id, "Keepalive task shutting down");
                break;
            }
        }
    }
}
