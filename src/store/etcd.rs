//! etcd v3 adapter
//!
//! Maps the [`CoordinationStore`] primitives onto `etcd-client`. The client
//! is cheap to clone (it shares one gRPC channel), so every operation works
//! on its own clone instead of locking a shared handle.
//!
//! Lease renewals are the exception: each lease keeps one bidirectional
//! keepalive stream open for its lifetime, created on first renewal and
//! dropped on revoke or when the lease is gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions, WatchOptions,
};
use futures::StreamExt;

use super::{
    CoordinationStore, EventKind, KeyValue, LeaseGrant, LeaseId, RangeResponse, Revision,
    StoreError, StoreEvent, WatchResponse, WatchStream,
};

/// Open keepalive stream of one lease
struct Keeper {
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

impl Keeper {
    async fn renew(&mut self, lease: LeaseId) -> Result<Duration, StoreError> {
        self.keeper.keep_alive().await.map_err(map_err)?;

        match self.stream.message().await.map_err(map_err)? {
            // etcd answers a renewal of an unknown lease with TTL 0
            Some(response) if response.ttl() > 0 => Ok(Duration::from_secs(response.ttl() as u64)),
            Some(_) => Err(StoreError::LeaseNotFound(lease)),
            None => Err(StoreError::Unavailable("lease keepalive stream closed".into())),
        }
    }
}

type Keepers = Arc<Mutex<HashMap<LeaseId, Arc<tokio::sync::Mutex<Keeper>>>>>;

/// Coordination store backed by an etcd cluster
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    keepers: Keepers,
}

impl EtcdStore {
    /// Connect to the given endpoints (`http://host:port` or `host:port`)
    pub async fn connect(endpoints: &[String]) -> Result<Self, StoreError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        tracing::info!(endpoints = ?endpoints, "Connected to etcd");
        Ok(Self {
            client,
            keepers: Arc::default(),
        })
    }

    fn cached_keeper(&self, lease: LeaseId) -> Option<Arc<tokio::sync::Mutex<Keeper>>> {
        self.keepers
            .lock()
            .ok()
            .and_then(|keepers| keepers.get(&lease).cloned())
    }

    fn forget_keeper(&self, lease: LeaseId) {
        if let Ok(mut keepers) = self.keepers.lock() {
            keepers.remove(&lease);
        }
    }

    /// The lease's keepalive stream, opened on first use
    async fn keeper(&self, lease: LeaseId) -> Result<Arc<tokio::sync::Mutex<Keeper>>, StoreError> {
        if let Some(keeper) = self.cached_keeper(lease) {
            return Ok(keeper);
        }

        let mut client = self.client.clone();
        let (keeper, stream) = client.lease_keep_alive(lease).await.map_err(map_err)?;
        let opened = Arc::new(tokio::sync::Mutex::new(Keeper { keeper, stream }));
        tracing::debug!(lease_id = lease, "Opened lease keepalive stream");

        let mut keepers = self
            .keepers
            .lock()
            .map_err(|_| StoreError::Other("keeper registry poisoned".into()))?;
        Ok(Arc::clone(keepers.entry(lease).or_insert(opened)))
    }

    #[cfg(test)]
    fn keeper_count(&self) -> usize {
        self.keepers.lock().map(|k| k.len()).unwrap_or_default()
    }
}

fn map_err(err: etcd_client::Error) -> StoreError {
    match err {
        etcd_client::Error::TransportError(e) => StoreError::Unavailable(e.to_string()),
        etcd_client::Error::IoError(e) => StoreError::Unavailable(e.to_string()),
        other => StoreError::Other(other.to_string()),
    }
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    let lease = kv.lease();
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: String::from_utf8_lossy(kv.value()).into_owned(),
        mod_revision: kv.mod_revision(),
        lease: (lease != 0).then_some(lease),
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> Result<RangeResponse, StoreError> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(map_err)?;

        let revision = response.header().map(|h| h.revision()).unwrap_or_default();
        Ok(RangeResponse {
            kvs: response.kvs().iter().map(convert_kv).collect(),
            revision,
        })
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<Revision, StoreError> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let response = client.put(key, value, options).await.map_err(map_err)?;
        Ok(response.header().map(|h| h.revision()).unwrap_or_default())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Revision,
    ) -> Result<WatchStream, StoreError> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision);
        let (watcher, stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(map_err)?;

        // The watcher handle cancels the watch when dropped, so it travels
        // with the stream state.
        let stream = futures::stream::unfold(
            (watcher, stream, false),
            |(watcher, mut stream, done)| async move {
                if done {
                    return None;
                }
                match stream.message().await {
                    Ok(Some(response)) if response.canceled() => {
                        let reason = format!(
                            "watch canceled (compact revision {})",
                            response.compact_revision()
                        );
                        Some((Err(StoreError::WatchClosed(reason)), (watcher, stream, true)))
                    }
                    Ok(Some(response)) => {
                        let revision = response.header().map(|h| h.revision()).unwrap_or_default();
                        let events = response
                            .events()
                            .iter()
                            .filter_map(|event| {
                                let kv = event.kv()?;
                                let kind = match event.event_type() {
                                    EventType::Put => EventKind::Put,
                                    EventType::Delete => EventKind::Delete,
                                };
                                Some(StoreEvent {
                                    kind,
                                    kv: convert_kv(kv),
                                })
                            })
                            .collect();
                        Some((Ok(WatchResponse { revision, events }), (watcher, stream, false)))
                    }
                    Ok(None) => None,
                    Err(e) => Some((
                        Err(StoreError::WatchClosed(e.to_string())),
                        (watcher, stream, true),
                    )),
                }
            },
        )
        .boxed();

        Ok(stream)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant, StoreError> {
        let mut client = self.client.clone();
        let response = client
            .lease_grant(ttl.as_secs() as i64, None)
            .await
            .map_err(|e| match map_err(e) {
                StoreError::Other(msg) => StoreError::LeaseRejected(msg),
                other => other,
            })?;

        Ok(LeaseGrant {
            id: response.id(),
            ttl: Duration::from_secs(response.ttl().max(0) as u64),
        })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration, StoreError> {
        let keeper = self.keeper(lease).await?;
        let result = keeper.lock().await.renew(lease).await;

        // A broken stream or a lapsed lease is not reused
        if result.is_err() {
            self.forget_keeper(lease);
        }
        result
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.forget_keeper(lease);
        let mut client = self.client.clone();
        client.lease_revoke(lease).await.map_err(map_err)?;
        Ok(())
    }
}
