//! Service discovery
//!
//! Turns a service name into a live, load-balanced set of channels:
//!
//! - [`address`]: endpoint value types and the store key layout
//! - [`backend`]: where addresses come from (coordination store or Nacos)
//! - [`resolver`]: snapshot-then-watch resolution with a single writer
//! - [`balancer`]: round-robin over per-address channels
//! - [`channel`]: a client channel bound to one [`Target`]

pub mod address;
pub mod backend;
pub mod balancer;
pub mod channel;
pub mod nacos;
pub mod resolver;
pub mod target;

pub use address::{service_prefix, Address, AddressChange, AddressSet, DEFAULT_SCHEME};
pub use backend::{ChangeBatch, DiscoveryBackend, Snapshot, StoreBackend};
pub use balancer::RoundRobin;
pub use channel::DiscoveredChannel;
pub use nacos::{NacosBackend, NacosConfig};
pub use resolver::{Resolution, ResolverEvent, ResolverHandle, ResolverStatus};
pub use target::Target;
