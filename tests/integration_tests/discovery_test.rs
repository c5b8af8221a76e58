//! Registration and resolution end-to-end
//!
//! Servers register through the registrar and clients resolve through their
//! own resolvers, all against one in-process coordination store.

use std::sync::Arc;
use std::time::Duration;

use hello_discovery::discovery::{
    Address, AddressSet, DiscoveredChannel, ResolverHandle, ResolverStatus, Target,
};
use hello_discovery::error::Error;
use hello_discovery::store::{CoordinationStore, MemoryStore};

use super::fixtures::{address, backend, registrar, wait_for_resolution, SCHEME, SERVICE};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

async fn store_addresses(store: &MemoryStore) -> AddressSet {
    store
        .get_prefix(&format!("{SERVICE}/"))
        .await
        .unwrap()
        .kvs
        .iter()
        .map(|kv| Address::from_store_key(SERVICE, &kv.key).unwrap())
        .collect()
}

// ============================================================================
// Registration Lifecycle
// ============================================================================

#[tokio::test]
async fn test_registered_servers_are_resolved() {
    let store = MemoryStore::new();
    let registrar = registrar(&store);

    let first = registrar
        .register(SERVICE, address(9001), Duration::from_secs(5))
        .await
        .unwrap();
    let _second = registrar
        .register(SERVICE, address(9002), Duration::from_secs(5))
        .await
        .unwrap();

    let resolver = ResolverHandle::start(backend(&store), SERVICE).await.unwrap();
    let initial = resolver.current();
    assert_eq!(initial.addresses.len(), 2);
    assert!(initial.addresses.contains(&address(9001)));
    assert!(initial.addresses.contains(&address(9002)));
    assert_eq!(initial.status, ResolverStatus::Healthy);

    // Release deletes the key right away, not after the TTL
    registrar.release(first).await.unwrap();

    let mut rx = resolver.subscribe();
    let resolution = wait_for_resolution(&mut rx, |r| r.addresses.len() == 1).await;
    assert!(resolution.addresses.contains(&address(9002)));
    assert!(!resolution.addresses.contains(&address(9001)));
}

#[tokio::test]
async fn test_new_registration_reaches_running_resolver() {
    let store = MemoryStore::new();
    let resolver = ResolverHandle::start(backend(&store), SERVICE).await.unwrap();
    assert!(resolver.current().addresses.is_empty());

    let _registration = registrar(&store)
        .register(SERVICE, address(9003), Duration::from_secs(5))
        .await
        .unwrap();

    let mut rx = resolver.subscribe();
    let resolution = wait_for_resolution(&mut rx, |r| !r.addresses.is_empty()).await;
    assert_eq!(resolution.addresses.to_vec(), vec![address(9003)]);
    assert_eq!(resolution.revision, store.revision().await);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_keeps_server_visible() {
    let store = MemoryStore::new();
    let registration = registrar(&store)
        .register(SERVICE, address(9004), Duration::from_secs(2))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;

    assert!(registration.keepalive_running());
    let resolver = ResolverHandle::start(backend(&store), SERVICE).await.unwrap();
    assert!(resolver.current().addresses.contains(&address(9004)));
}

#[tokio::test(start_paused = true)]
async fn test_crashed_server_disappears_after_ttl() {
    let store = MemoryStore::new();
    let registration = registrar(&store)
        .register(SERVICE, address(9005), Duration::from_secs(5))
        .await
        .unwrap();

    let watching = ResolverHandle::start(backend(&store), SERVICE).await.unwrap();
    assert_eq!(watching.current().addresses.len(), 1);

    // No release and no more renewals
    registration.abandon().await;

    tokio::time::sleep(Duration::from_secs(4)).await;
    let before_expiry = ResolverHandle::start(backend(&store), SERVICE).await.unwrap();
    assert!(before_expiry.current().addresses.contains(&address(9005)));

    tokio::time::sleep(Duration::from_secs(2)).await;

    // A fresh client no longer sees the server
    let fresh = ResolverHandle::start(backend(&store), SERVICE).await.unwrap();
    assert!(fresh.current().addresses.is_empty());

    // And the running resolver saw the DELETE
    let mut rx = watching.subscribe();
    let resolution = wait_for_resolution(&mut rx, |r| r.addresses.is_empty()).await;
    assert_eq!(resolution.status, ResolverStatus::Healthy);
}

// ============================================================================
// Snapshot / Watch Boundary
// ============================================================================

#[tokio::test]
async fn test_writes_during_startup_are_neither_lost_nor_duplicated() {
    let store = MemoryStore::new();
    for port in 9100..9105 {
        store
            .put(&address(port).store_key(SERVICE, SCHEME), "1", None)
            .await
            .unwrap();
    }

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for port in 9105..9140 {
                let key = address(port).store_key(SERVICE, SCHEME);
                store.put(&key, "1", None).await.unwrap();
                if port % 3 == 0 {
                    store
                        .delete(&address(port - 5).store_key(SERVICE, SCHEME))
                        .await
                        .unwrap();
                }
                tokio::task::yield_now().await;
            }
        })
    };

    let resolver = ResolverHandle::start(backend(&store), SERVICE).await.unwrap();
    writer.await.unwrap();

    let final_revision = store.revision().await;
    let expected = store_addresses(&store).await;

    let mut rx = resolver.subscribe();
    let resolution = wait_for_resolution(&mut rx, |r| r.revision == final_revision).await;
    assert_eq!(*resolution.addresses, expected);
    assert_eq!(resolution.status, ResolverStatus::Healthy);
}

#[tokio::test]
async fn test_other_services_are_not_resolved() {
    let store = MemoryStore::new();
    let _ours = registrar(&store)
        .register(SERVICE, address(9200), Duration::from_secs(5))
        .await
        .unwrap();
    let _theirs = registrar(&store)
        .register("hello-grpc-admin", address(9201), Duration::from_secs(5))
        .await
        .unwrap();

    let resolver = ResolverHandle::start(backend(&store), SERVICE).await.unwrap();
    assert_eq!(resolver.current().addresses.to_vec(), vec![address(9200)]);
}

// ============================================================================
// Channels
// ============================================================================

#[tokio::test]
async fn test_clients_resolve_independently() {
    let store = MemoryStore::new();
    let _registration = registrar(&store)
        .register(SERVICE, address(9300), Duration::from_secs(5))
        .await
        .unwrap();

    let target: Target = format!("etcd:///{SERVICE}").parse().unwrap();
    let first = DiscoveredChannel::open(target.clone(), Some(backend(&store)), CONNECT_TIMEOUT)
        .await
        .unwrap();
    let second = DiscoveredChannel::open(target, Some(backend(&store)), CONNECT_TIMEOUT)
        .await
        .unwrap();

    first.close();
    let mut closed = first.subscribe();
    wait_for_resolution(&mut closed, |r| r.status == ResolverStatus::Closed).await;
    assert!(matches!(first.pick().await, Err(Error::Closed)));

    let _late = registrar(&store)
        .register(SERVICE, address(9301), Duration::from_secs(5))
        .await
        .unwrap();

    let mut rx = second.subscribe();
    wait_for_resolution(&mut rx, |r| r.addresses.len() == 2).await;
    assert_eq!(second.addresses().await.unwrap().len(), 2);
    assert!(!second.is_terminal());
}

#[tokio::test]
async fn test_picks_rotate_over_registered_servers() {
    let store = MemoryStore::new();
    let registrar = registrar(&store);
    let mut registrations = Vec::new();
    for port in [9400, 9401, 9402] {
        registrations.push(
            registrar
                .register(SERVICE, address(port), Duration::from_secs(5))
                .await
                .unwrap(),
        );
    }

    let channel = DiscoveredChannel::open(
        format!("etcd:///{SERVICE}").parse().unwrap(),
        Some(backend(&store)),
        CONNECT_TIMEOUT,
    )
    .await
    .unwrap();

    let mut picked = Vec::new();
    for _ in 0..6 {
        picked.push(channel.pick().await.unwrap().0.port);
    }
    assert_eq!(&picked[..3], &picked[3..]);
    let mut distinct = picked[..3].to_vec();
    distinct.sort_unstable();
    assert_eq!(distinct, vec![9400, 9401, 9402]);
}

#[tokio::test]
async fn test_broken_watch_makes_channel_terminal() {
    let store = MemoryStore::new();
    let _registration = registrar(&store)
        .register(SERVICE, address(9500), Duration::from_secs(5))
        .await
        .unwrap();

    let channel = Arc::new(
        DiscoveredChannel::open(
            format!("etcd:///{SERVICE}").parse().unwrap(),
            Some(backend(&store)),
            CONNECT_TIMEOUT,
        )
        .await
        .unwrap(),
    );
    assert!(channel.pick().await.is_ok());

    store.fail_watches("connection reset").await;

    let mut rx = channel.subscribe();
    let resolution = wait_for_resolution(&mut rx, |r| r.is_terminal()).await;
    assert!(matches!(resolution.status, ResolverStatus::Failed(_)));

    // Last known addresses stay visible, but picks fail fast
    assert!(resolution.addresses.contains(&address(9500)));
    assert!(matches!(channel.pick().await, Err(Error::WatchStream(_))));
}
