//! Watch-based resolver
//!
//! Resolution runs in three steps:
//!
//! 1. list the service prefix and remember the serving revision `R`
//! 2. publish the resulting address set right away, even when it is empty
//! 3. watch the prefix from `R + 1` and publish after every batch
//!
//! Watch output is converted into tagged [`ResolverEvent`]s by a forwarding
//! task. A single processing task owns the [`AddressSet`], so the set has
//! exactly one writer. Subscribers read immutable [`Resolution`] snapshots
//! from a `tokio::sync::watch` channel.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::address::{Address, AddressChange, AddressSet};
use super::backend::{ChangeStream, DiscoveryBackend};
use crate::error::{Error, Result};
use crate::store::Revision;

// ============================================================================
// Resolver Types
// ============================================================================

/// Health of a resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverStatus {
    /// Watch is running and the address set is current
    Healthy,

    /// Watch stream broke; the address set is the last known state
    Failed(String),

    /// Resolver was closed by its owner
    Closed,
}

/// Snapshot published to subscribers
#[derive(Debug, Clone)]
pub struct Resolution {
    pub addresses: Arc<AddressSet>,

    /// Last fully processed revision
    pub revision: Revision,

    pub status: ResolverStatus,
}

impl Resolution {
    pub(crate) fn healthy(addresses: AddressSet, revision: Revision) -> Self {
        Self {
            addresses: Arc::new(addresses),
            revision,
            status: ResolverStatus::Healthy,
        }
    }

    /// Whether the resolver has stopped for good
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, ResolverStatus::Healthy)
    }

    /// Error for a failed resolution, if any
    pub fn error(&self) -> Option<Error> {
        match &self.status {
            ResolverStatus::Healthy => None,
            ResolverStatus::Failed(reason) => Some(Error::WatchStream(reason.clone())),
            ResolverStatus::Closed => Some(Error::Closed),
        }
    }
}

/// Tagged event fed to the processing task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverEvent {
    AddressPut(Address),
    AddressDelete(Address),

    /// All events of one revision were delivered
    BatchEnd { revision: Revision },

    /// Watch ended; `Some` carries the failure reason
    StreamClosed(Option<String>),
}

// ============================================================================
// Resolver Handle
// ============================================================================

/// A running resolver for one service
///
/// Dropping the handle stops both background tasks.
pub struct ResolverHandle {
    service: String,
    state_rx: watch::Receiver<Resolution>,
    shutdown_tx: watch::Sender<bool>,
    forward_task: JoinHandle<()>,
    process_task: JoinHandle<()>,
}

impl ResolverHandle {
    /// Start resolving `service` through `backend`
    ///
    /// Returns once the initial snapshot is published and the watch is open.
    pub async fn start(backend: DiscoveryBackend, service: impl Into<String>) -> Result<Self> {
        let service = service.into();

        let snapshot = backend.list(&service).await?;
        let addresses: AddressSet = snapshot.addresses.into_iter().collect();
        let revision = snapshot.revision;

        tracing::info!(
            service = %service,
            backend = backend.kind(),
            revision,
            addresses = addresses.len(),
            "Initial resolution"
        );

        let (state_tx, state_rx) =
            watch::channel(Resolution::healthy(addresses.clone(), revision));

        let stream = backend.watch(&service, revision + 1).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::channel(256);

        let forward_task = tokio::spawn(forward_events(backend, stream, event_tx, shutdown_rx));
        let process_task = tokio::spawn(process_events(
            service.clone(),
            addresses,
            revision,
            event_rx,
            state_tx,
        ));

        Ok(Self {
            service,
            state_rx,
            shutdown_tx,
            forward_task,
            process_task,
        })
    }

    /// Service this resolver watches
    pub fn service(&self) -> &str {
        &self.service
    }

    /// New receiver of resolution snapshots
    pub fn subscribe(&self) -> watch::Receiver<Resolution> {
        self.state_rx.clone()
    }

    /// Latest published snapshot
    pub fn current(&self) -> Resolution {
        self.state_rx.borrow().clone()
    }

    /// Stop watching; subscribers observe [`ResolverStatus::Closed`]
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether both background tasks have exited
    pub fn is_finished(&self) -> bool {
        self.forward_task.is_finished() && self.process_task.is_finished()
    }
}

impl Drop for ResolverHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.forward_task.abort();
        self.process_task.abort();
    }
}

// ============================================================================
// Background Tasks
// ============================================================================

/// Owns `backend` for as long as `stream` is read; some stores tie their
/// watch channels to the store handle.
async fn forward_events(
    backend: DiscoveryBackend,
    mut stream: ChangeStream,
    events: mpsc::Sender<ResolverEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _backend = backend;

    loop {
        let item = tokio::select! {
            _ = shutdown.changed() => break,
            item = stream.next() => item,
        };

        let outgoing = match item {
            Some(Ok(batch)) => {
                let mut outgoing: Vec<ResolverEvent> = batch
                    .changes
                    .into_iter()
                    .map(|change| match change {
                        AddressChange::Put(a) => ResolverEvent::AddressPut(a),
                        AddressChange::Delete(a) => ResolverEvent::AddressDelete(a),
                    })
                    .collect();
                outgoing.push(ResolverEvent::BatchEnd {
                    revision: batch.revision,
                });
                outgoing
            }
            Some(Err(e)) => {
                let reason = match e {
                    Error::WatchStream(reason) => reason,
                    other => other.to_string(),
                };
                vec![ResolverEvent::StreamClosed(Some(reason))]
            }
            None => vec![ResolverEvent::StreamClosed(None)],
        };

        let closing = matches!(outgoing.last(), Some(ResolverEvent::StreamClosed(_)));
        for event in outgoing {
            if events.send(event).await.is_err() {
                return;
            }
        }
        if closing {
            return;
        }
    }
}

async fn process_events(
    service: String,
    mut addresses: AddressSet,
    mut revision: Revision,
    mut events: mpsc::Receiver<ResolverEvent>,
    state: watch::Sender<Resolution>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ResolverEvent::AddressPut(address) => {
                if addresses.insert(address.clone()) {
                    tracing::debug!(service = %service, address = %address, "Address added");
                }
            }
            ResolverEvent::AddressDelete(address) => {
                if addresses.remove(&address) {
                    tracing::debug!(service = %service, address = %address, "Address removed");
                } else {
                    tracing::warn!(
                        service = %service,
                        address = %address,
                        "DELETE for unknown address ignored"
                    );
                }
            }
            ResolverEvent::BatchEnd { revision: batch_revision } => {
                revision = batch_revision;
                state.send_replace(Resolution::healthy(addresses.clone(), revision));
                tracing::debug!(
                    service = %service,
                    revision,
                    addresses = addresses.len(),
                    "Published address set"
                );
            }
            ResolverEvent::StreamClosed(reason) => {
                let reason = reason.unwrap_or_else(|| "watch stream closed".to_string());
                tracing::error!(service = %service, revision, "Resolver failed: {reason}");
                state.send_replace(Resolution {
                    addresses: Arc::new(addresses),
                    revision,
                    status: ResolverStatus::Failed(reason),
                });
                return;
            }
        }
    }

    // Forwarder stopped on shutdown
    tracing::debug!(service = %service, "Resolver closed");
    state.send_replace(Resolution {
        addresses: Arc::new(addresses),
        revision,
        status: ResolverStatus::Closed,
    });
}
