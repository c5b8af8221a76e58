//! Client channel over discovered addresses
//!
//! A [`DiscoveredChannel`] owns its own resolver (no shared global state)
//! and a round-robin balancer. The balancer is synced from the latest
//! resolution lazily, on the next pick after the address set changed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tonic::transport::Channel;

use super::address::{Address, AddressSet};
use super::backend::DiscoveryBackend;
use super::balancer::RoundRobin;
use super::resolver::{Resolution, ResolverHandle, ResolverStatus};
use super::target::Target;
use crate::error::{Error, Result};

enum Source {
    Resolver(ResolverHandle),
    Fixed(watch::Sender<Resolution>),
}

struct Balanced {
    /// Address set the balancer was last built from
    synced: Arc<AddressSet>,
    round_robin: RoundRobin,
}

/// A load-balanced channel to one target
pub struct DiscoveredChannel {
    target: Target,
    source: Source,
    resolution: watch::Receiver<Resolution>,
    balanced: RwLock<Balanced>,
}

impl DiscoveredChannel {
    /// Open a channel for `target`
    ///
    /// Discovery targets need a backend of the matching kind; static targets
    /// ignore it.
    pub async fn open(
        target: Target,
        backend: Option<DiscoveryBackend>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let service = match &target {
            Target::Static(address) => return Self::fixed(address.clone(), connect_timeout),
            Target::Etcd { service } | Target::Nacos { service } => service.clone(),
        };

        let compatible = matches!(
            (&target, &backend),
            (Target::Etcd { .. }, Some(DiscoveryBackend::Store(_)))
                | (Target::Nacos { .. }, Some(DiscoveryBackend::Nacos(_)))
        );

        match backend {
            Some(backend) if compatible => {
                Self::discover(target, backend, service, connect_timeout).await
            }
            backend => Err(Error::InvalidTarget(format!(
                "target '{target}' cannot resolve through backend '{}'",
                backend.as_ref().map(|b| b.kind()).unwrap_or("none")
            ))),
        }
    }

    /// Channel over a single static address
    pub fn fixed(address: Address, connect_timeout: Duration) -> Result<Self> {
        let addresses: AddressSet = std::iter::once(address.clone()).collect();
        let (tx, rx) = watch::channel(Resolution::healthy(addresses, 0));
        Self::with_source(Target::Static(address), Source::Fixed(tx), rx, connect_timeout)
    }

    async fn discover(
        target: Target,
        backend: DiscoveryBackend,
        service: String,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let resolver = ResolverHandle::start(backend, service).await?;
        let rx = resolver.subscribe();
        Self::with_source(target, Source::Resolver(resolver), rx, connect_timeout)
    }

    fn with_source(
        target: Target,
        source: Source,
        resolution: watch::Receiver<Resolution>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let current = resolution.borrow().clone();
        let mut round_robin = RoundRobin::new(connect_timeout);
        round_robin.update(&current.addresses)?;

        Ok(Self {
            target,
            source,
            resolution,
            balanced: RwLock::new(Balanced {
                synced: current.addresses,
                round_robin,
            }),
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Latest resolution
    pub fn resolution(&self) -> Resolution {
        self.resolution.borrow().clone()
    }

    /// Receiver of resolution updates
    pub fn subscribe(&self) -> watch::Receiver<Resolution> {
        self.resolution.clone()
    }

    /// Whether the channel can no longer follow address changes
    pub fn is_terminal(&self) -> bool {
        self.resolution.borrow().is_terminal()
    }

    /// Rebuild the balancer if the address set moved on
    async fn sync(&self) -> Result<()> {
        let addresses = self.resolution.borrow().addresses.clone();

        if Arc::ptr_eq(&self.balanced.read().await.synced, &addresses) {
            return Ok(());
        }

        let mut balanced = self.balanced.write().await;
        if !Arc::ptr_eq(&balanced.synced, &addresses) {
            balanced.round_robin.update(&addresses)?;
            balanced.synced = addresses;
            tracing::debug!(
                target_name = %self.target,
                addresses = balanced.round_robin.len(),
                "Balancer synced"
            );
        }
        Ok(())
    }

    /// Pick the next address without waiting
    ///
    /// Fails fast with `NoAddressesAvailable` on an empty set, and with the
    /// resolver's error once the channel is terminal.
    pub async fn pick(&self) -> Result<(Address, Channel)> {
        if let Some(err) = self.resolution.borrow().error() {
            return Err(err);
        }

        self.sync().await?;
        self.balanced
            .read()
            .await
            .round_robin
            .pick()
            .ok_or_else(|| Error::NoAddressesAvailable {
                service: self.target.service(),
            })
    }

    /// Pick, waiting up to `timeout` for the address set to become non-empty
    pub async fn pick_ready(&self, timeout: Duration) -> Result<(Address, Channel)> {
        let mut rx = self.subscribe();
        let ready = tokio::time::timeout(timeout, async {
            rx.wait_for(|r| !r.addresses.is_empty() || r.is_terminal())
                .await
                .map(|_| ())
        })
        .await;

        match ready {
            Ok(Ok(_)) => self.pick().await,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::NoAddressesAvailable {
                service: self.target.service(),
            }),
        }
    }

    /// Current addresses in pick order
    pub async fn addresses(&self) -> Result<Vec<Address>> {
        self.sync().await?;
        Ok(self.balanced.read().await.round_robin.addresses().to_vec())
    }

    /// Stop following address changes
    pub fn close(&self) {
        match &self.source {
            Source::Resolver(resolver) => resolver.close(),
            Source::Fixed(tx) => {
                tx.send_modify(|r| r.status = ResolverStatus::Closed);
            }
        }
    }
}
