//! hello-discovery - service discovery and resilient channels for gRPC clients
//!
//! Servers register themselves in an etcd-like coordination store under a
//! lease; clients resolve the live address set with a snapshot-then-watch
//! resolver and keep their channel usable across backend restarts.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration from environment variables or TOML
//! - [`store`] - Coordination store primitives (in-memory, etcd)
//! - [`discovery`] - Addresses, backends, the watch resolver and balancing
//! - [`registrar`] - Lease-backed service registration with keepalive
//! - [`reconnect`] - Channel-level reconnect state machine
//! - [`retry`] - Stateless per-call retry
//! - [`error`] - Unified error type
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use hello_discovery::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
//!
//!     let registrar = Registrar::new(Arc::clone(&store), "grpc");
//!     let registration = registrar
//!         .register("hello-grpc", Address::new("127.0.0.1", 9996), Duration::from_secs(5))
//!         .await?;
//!
//!     let resolver = ResolverHandle::start(DiscoveryBackend::store(store), "hello-grpc").await?;
//!     println!("{} live address(es)", resolver.current().addresses.len());
//!
//!     registration.release().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod reconnect;
pub mod registrar;
pub mod retry;
pub mod store;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, DiscoveryConfig, DiscoveryKind};
    pub use crate::discovery::{
        Address, AddressSet, DiscoveredChannel, DiscoveryBackend, ResolverHandle, ResolverStatus,
        Target,
    };
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::reconnect::{
        ConnectionState, DiscoveryChannelFactory, ReconnectConfig, ReconnectController,
    };
    pub use crate::registrar::{Registrar, Registration};
    pub use crate::retry::{retry_call, RetryConfig};
    pub use crate::store::{CoordinationStore, MemoryStore};
}
