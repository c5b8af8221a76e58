//! Coordination store client
//!
//! The coordination store is an external etcd-like service. This module
//! defines the three primitive groups the rest of the crate depends on:
//!
//! - prefix range reads pinned to a store revision
//! - revision-ordered watches starting at a given revision
//! - leases with a TTL, keepalive and revoke
//!
//! Two implementations are provided: [`MemoryStore`] runs in-process (tests
//! and local runs) and `EtcdStore` talks to a real etcd v3 cluster when the
//! `etcd` feature is enabled.

pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use memory::MemoryStore;

#[cfg(feature = "etcd")]
pub use self::etcd::EtcdStore;

/// Store revision number
pub type Revision = i64;

/// Lease identifier
pub type LeaseId = i64;

// ============================================================================
// Store Types
// ============================================================================

/// A key/value pair as stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,

    /// Revision of the last modification
    pub mod_revision: Revision,

    /// Lease the key is bound to, if any
    pub lease: Option<LeaseId>,
}

/// Result of a prefix read
#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,

    /// Store revision the read was served at
    pub revision: Revision,
}

/// Kind of a watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A single change observed by a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: EventKind,
    pub kv: KeyValue,
}

/// A batch of events delivered together by a watch
#[derive(Debug, Clone, Default)]
pub struct WatchResponse {
    /// Highest revision covered by this batch
    pub revision: Revision,
    pub events: Vec<StoreEvent>,
}

/// Result of a lease grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: LeaseId,
    pub ttl: Duration,
}

/// Stream of watch batches; ends or yields an error when the watch breaks
pub type WatchStream = BoxStream<'static, Result<WatchResponse, StoreError>>;

// ============================================================================
// Coordination Store Trait
// ============================================================================

/// Primitives of an etcd-like coordination store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read every key under `prefix` together with the serving revision
    async fn get_prefix(&self, prefix: &str) -> Result<RangeResponse, StoreError>;

    /// Write a key, optionally bound to a lease
    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<Revision, StoreError>;

    /// Watch every key under `prefix`, delivering events with
    /// revision >= `start_revision`
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Revision,
    ) -> Result<WatchStream, StoreError>;

    /// Grant a lease with the requested TTL
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant, StoreError>;

    /// Renew a lease once, returning the refreshed TTL
    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration, StoreError>;

    /// Revoke a lease, deleting every key bound to it
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError>;
}

// ============================================================================
// Errors
// ============================================================================

/// Coordination store errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store cannot be reached
    Unavailable(String),

    /// Lease request rejected
    LeaseRejected(String),

    /// Lease does not exist (expired or revoked)
    LeaseNotFound(LeaseId),

    /// Requested watch revision was already compacted
    Compacted { requested: Revision, compact_revision: Revision },

    /// Watch was canceled or the stream broke
    WatchClosed(String),

    /// Any other store-side failure
    Other(String),
}

impl StoreError {
    /// Whether retrying the same request later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::WatchClosed(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "Store unavailable: {msg}"),
            Self::LeaseRejected(msg) => write!(f, "Lease rejected: {msg}"),
            Self::LeaseNotFound(id) => write!(f, "Lease not found: {id}"),
            Self::Compacted {
                requested,
                compact_revision,
            } => write!(
                f,
                "Revision {requested} compacted (compact revision {compact_revision})"
            ),
            Self::WatchClosed(msg) => write!(f, "Watch closed: {msg}"),
            Self::Other(msg) => write!(f, "Store error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}
