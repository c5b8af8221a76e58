//! Test fixtures for integration tests
//!
//! Shared constants and helpers for building stores, backends and waiting on
//! resolver updates.

use std::sync::Arc;
use std::time::Duration;

use hello_discovery::discovery::{Address, DiscoveryBackend, Resolution};
use hello_discovery::registrar::Registrar;
use hello_discovery::store::MemoryStore;
use tokio::sync::watch;

pub const SERVICE: &str = "hello-grpc";

pub const SCHEME: &str = "grpc";

/// Sample Nacos instance list with one unhealthy and one disabled host
pub const NACOS_INSTANCES_JSON: &str = r#"{
    "name": "DEFAULT_GROUP@@hello-grpc",
    "clusters": "",
    "cacheMillis": 10000,
    "hosts": [
        {"ip": "10.0.0.1", "port": 9996, "healthy": true, "enabled": true, "weight": 1.0},
        {"ip": "10.0.0.2", "port": 9996, "healthy": true, "enabled": true, "weight": 1.0},
        {"ip": "10.0.0.3", "port": 9996, "healthy": false, "enabled": true, "weight": 1.0},
        {"ip": "10.0.0.4", "port": 9996, "healthy": true, "enabled": false, "weight": 1.0}
    ]
}"#;

/// The same service after 10.0.0.1 went away and 10.0.0.5 joined
pub const NACOS_INSTANCES_CHANGED_JSON: &str = r#"{
    "name": "DEFAULT_GROUP@@hello-grpc",
    "hosts": [
        {"ip": "10.0.0.2", "port": 9996, "healthy": true, "enabled": true},
        {"ip": "10.0.0.5", "port": 9996, "healthy": true, "enabled": true}
    ]
}"#;

pub fn address(port: u16) -> Address {
    Address::new("127.0.0.1", port)
}

pub fn backend(store: &MemoryStore) -> DiscoveryBackend {
    DiscoveryBackend::store(Arc::new(store.clone()))
}

pub fn registrar(store: &MemoryStore) -> Registrar {
    Registrar::new(Arc::new(store.clone()), SCHEME)
}

/// Wait until a resolution satisfying `predicate` is published
pub async fn wait_for_resolution<P>(rx: &mut watch::Receiver<Resolution>, predicate: P) -> Resolution
where
    P: FnMut(&Resolution) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for resolution")
        .expect("resolver dropped")
        .clone()
}
