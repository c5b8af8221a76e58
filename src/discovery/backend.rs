//! Discovery backends
//!
//! A backend answers two questions for a service name: which addresses are
//! live right now (`list`, pinned to a revision), and what changed after a
//! given revision (`watch`). Backends form a closed set; adding one means
//! adding a variant here, the resolver stays untouched.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;

use super::address::{service_prefix, Address, AddressChange};
use super::nacos::NacosBackend;
use crate::error::{Error, Result};
use crate::store::{CoordinationStore, EventKind, Revision};

/// Addresses of a service as of one store revision
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub addresses: Vec<Address>,
    pub revision: Revision,
}

/// Changes delivered together at one revision
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub revision: Revision,
    pub changes: Vec<AddressChange>,
}

/// Stream of change batches for one service
pub type ChangeStream = BoxStream<'static, Result<ChangeBatch>>;

// ============================================================================
// Discovery Backend
// ============================================================================

/// Where service addresses come from
#[derive(Clone)]
pub enum DiscoveryBackend {
    /// etcd-like coordination store with revisioned watches
    Store(StoreBackend),

    /// Nacos naming service, polled over HTTP
    Nacos(NacosBackend),
}

impl DiscoveryBackend {
    /// Backend over any coordination store
    pub fn store(store: Arc<dyn CoordinationStore>) -> Self {
        Self::Store(StoreBackend::new(store))
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Nacos(_) => "nacos",
        }
    }

    /// Current addresses of `service` and the revision they were read at
    pub async fn list(&self, service: &str) -> Result<Snapshot> {
        match self {
            Self::Store(backend) => backend.list(service).await,
            Self::Nacos(backend) => backend.list(service).await,
        }
    }

    /// Changes to `service` at or after `from_revision`
    pub async fn watch(&self, service: &str, from_revision: Revision) -> Result<ChangeStream> {
        match self {
            Self::Store(backend) => backend.watch(service, from_revision).await,
            Self::Nacos(backend) => backend.watch(service, from_revision).await,
        }
    }
}

// ============================================================================
// Store Backend
// ============================================================================

/// Discovery over a [`CoordinationStore`] using the `service/` key prefix
#[derive(Clone)]
pub struct StoreBackend {
    store: Arc<dyn CoordinationStore>,
}

impl StoreBackend {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Underlying store handle
    pub fn store(&self) -> Arc<dyn CoordinationStore> {
        Arc::clone(&self.store)
    }

    async fn list(&self, service: &str) -> Result<Snapshot> {
        let prefix = service_prefix(service);
        let range = self.store.get_prefix(&prefix).await?;

        let addresses = range
            .kvs
            .iter()
            .filter_map(|kv| match Address::from_store_key(service, &kv.key) {
                Ok(address) => Some(address),
                Err(e) => {
                    tracing::warn!(service = %service, key = %kv.key, "Skipping unparsable key: {e}");
                    None
                }
            })
            .collect();

        Ok(Snapshot {
            addresses,
            revision: range.revision,
        })
    }

    async fn watch(&self, service: &str, from_revision: Revision) -> Result<ChangeStream> {
        let prefix = service_prefix(service);
        let stream = self.store.watch_prefix(&prefix, from_revision).await?;
        let service = service.to_string();

        let changes = stream.map(move |item| {
            let response = item.map_err(Error::from)?;
            let changes = response
                .events
                .iter()
                .filter_map(|event| match Address::from_store_key(&service, &event.kv.key) {
                    Ok(address) => Some(match event.kind {
                        EventKind::Put => AddressChange::Put(address),
                        EventKind::Delete => AddressChange::Delete(address),
                    }),
                    Err(e) => {
                        tracing::warn!(
                            service = %service,
                            key = %event.kv.key,
                            "Ignoring event for unparsable key: {e}"
                        );
                        None
                    }
                })
                .collect();

            Ok(ChangeBatch {
                revision: response.revision,
                changes,
            })
        });

        Ok(changes.boxed())
    }
}
