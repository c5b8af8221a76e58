//! In-process coordination store
//!
//! `MemoryStore` keeps the same contract as an etcd v3 cluster for the
//! primitives this crate uses: a single global revision counter, prefix reads
//! served at the current revision, watches that replay history from any
//! start revision before streaming live changes, and leases whose keys are
//! deleted when the TTL runs out without a keepalive.
//!
//! Lease expiry is driven by `tokio::time`, so tests running with a paused
//! clock observe TTL expiry deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use super::{
    CoordinationStore, EventKind, KeyValue, LeaseGrant, LeaseId, RangeResponse, Revision,
    StoreError, StoreEvent, WatchResponse, WatchStream,
};

/// How often expired leases are swept
const REAPER_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Store State
// ============================================================================

#[derive(Debug)]
struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Result<WatchResponse, StoreError>>,
}

#[derive(Default)]
struct Inner {
    revision: Revision,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease_id: LeaseId,

    /// Every committed event in revision order
    history: Vec<(Revision, StoreEvent)>,

    watchers: Vec<Watcher>,
}

impl Inner {
    /// Commit a set of events as one revision and fan them out to watchers
    fn commit(&mut self, events: Vec<StoreEvent>) -> Revision {
        self.revision += 1;
        let revision = self.revision;

        let events: Vec<StoreEvent> = events
            .into_iter()
            .map(|mut event| {
                event.kv.mod_revision = revision;
                event
            })
            .collect();

        for event in &events {
            self.history.push((revision, event.clone()));
        }

        self.watchers.retain(|watcher| {
            let matching: Vec<StoreEvent> = events
                .iter()
                .filter(|e| e.kv.key.starts_with(&watcher.prefix))
                .cloned()
                .collect();

            if matching.is_empty() {
                return !watcher.tx.is_closed();
            }

            watcher
                .tx
                .send(Ok(WatchResponse {
                    revision,
                    events: matching,
                }))
                .is_ok()
        });

        revision
    }

    fn delete_keys(&mut self, keys: Vec<String>) -> Option<Revision> {
        let events: Vec<StoreEvent> = keys
            .into_iter()
            .filter_map(|key| self.kvs.remove(&key))
            .map(|kv| StoreEvent {
                kind: EventKind::Delete,
                kv,
            })
            .collect();

        if events.is_empty() {
            None
        } else {
            Some(self.commit(events))
        }
    }

    fn keys_for_lease(&self, lease: LeaseId) -> Vec<String> {
        self.kvs
            .values()
            .filter(|kv| kv.lease == Some(lease))
            .map(|kv| kv.key.clone())
            .collect()
    }

    /// Drop leases past their deadline together with their keys
    fn expire(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for lease in expired {
            self.leases.remove(&lease);
            let keys = self.keys_for_lease(lease);
            tracing::debug!(lease_id = lease, keys = keys.len(), "Lease expired");
            self.delete_keys(keys);
        }
    }

    /// Group history at or after `start` into per-revision batches
    fn replay(&self, prefix: &str, start: Revision) -> Vec<WatchResponse> {
        let mut batches: Vec<WatchResponse> = Vec::new();

        for (revision, event) in &self.history {
            if *revision < start || !event.kv.key.starts_with(prefix) {
                continue;
            }

            match batches.last_mut() {
                Some(batch) if batch.revision == *revision => batch.events.push(event.clone()),
                _ => batches.push(WatchResponse {
                    revision: *revision,
                    events: vec![event.clone()],
                }),
            }
        }

        batches
    }
}

// ============================================================================
// Memory Store
// ============================================================================

/// In-process etcd-like store
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    available: Arc<AtomicBool>,
    reaper_started: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create an empty store at revision 0
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_lease_id: 1,
                ..Default::default()
            })),
            available: Arc::new(AtomicBool::new(true)),
            reaper_started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate the store becoming (un)reachable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Break every open watch with an error, as a dropped connection would
    pub async fn fail_watches(&self, reason: &str) {
        let mut inner = self.inner.lock().await;
        for watcher in inner.watchers.drain(..) {
            let _ = watcher
                .tx
                .send(Err(StoreError::WatchClosed(reason.to_string())));
        }
    }

    /// Delete a single key
    pub async fn delete(&self, key: &str) -> Result<Option<Revision>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.expire(Instant::now());
        Ok(inner.delete_keys(vec![key.to_string()]))
    }

    /// Current store revision
    pub async fn revision(&self) -> Revision {
        self.inner.lock().await.revision
    }

    /// Whether a lease is still alive
    pub async fn has_lease(&self, lease: LeaseId) -> bool {
        let mut inner = self.inner.lock().await;
        inner.expire(Instant::now());
        inner.leases.contains_key(&lease)
    }

    /// Number of open watch subscriptions
    pub async fn watcher_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }

    fn ensure_reaper(&self) {
        if self.reaper_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.lock().await.expire(Instant::now());
            }
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get_prefix(&self, prefix: &str) -> Result<RangeResponse, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.expire(Instant::now());

        let kvs = inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();

        Ok(RangeResponse {
            kvs,
            revision: inner.revision,
        })
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<Revision, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.expire(Instant::now());

        if let Some(id) = lease {
            if !inner.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }

        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_string(),
            mod_revision: 0,
            lease,
        };
        let revision = inner.commit(vec![StoreEvent {
            kind: EventKind::Put,
            kv: kv.clone(),
        }]);
        inner.kvs.insert(
            key.to_string(),
            KeyValue {
                mod_revision: revision,
                ..kv
            },
        );

        Ok(revision)
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Revision,
    ) -> Result<WatchStream, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;

        let (tx, rx) = mpsc::unbounded_channel();
        for batch in inner.replay(prefix, start_revision) {
            let _ = tx.send(Ok(batch));
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(stream)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant, StoreError> {
        self.check_available()?;
        if ttl.is_zero() {
            return Err(StoreError::LeaseRejected("TTL must be positive".to_string()));
        }

        self.ensure_reaper();
        let mut inner = self.inner.lock().await;
        let id = inner.next_lease_id;
        inner.next_lease_id += 1;
        inner.leases.insert(
            id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );

        Ok(LeaseGrant { id, ttl })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.expire(now);

        let entry = inner
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        entry.deadline = now + entry.ttl;
        Ok(entry.ttl)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;

        if inner.leases.remove(&lease).is_none() {
            return Err(StoreError::LeaseNotFound(lease));
        }
        let keys = inner.keys_for_lease(lease);
        inner.delete_keys(keys);
        Ok(())
    }
}
