//! Reconnect controller over discovered channels

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hello_discovery::discovery::{Address, DiscoveredChannel, DiscoveryBackend, Target};
use hello_discovery::error::{Error, Result};
use hello_discovery::reconnect::{
    ChannelFactory, ConnectionState, DiscoveryChannelFactory, ReconnectConfig,
    ReconnectController,
};
use hello_discovery::store::MemoryStore;
use tonic::Status;

use super::fixtures::{address, backend, registrar, SERVICE};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

fn target() -> Target {
    Target::Etcd {
        service: SERVICE.to_string(),
    }
}

/// Opens discovered channels and only checks that an address is known
struct ResolvingFactory {
    backend: DiscoveryBackend,
    connects: Arc<AtomicU64>,
}

impl ResolvingFactory {
    fn new(store: &MemoryStore) -> (Self, Arc<AtomicU64>) {
        let connects = Arc::new(AtomicU64::new(0));
        let factory = Self {
            backend: backend(store),
            connects: Arc::clone(&connects),
        };
        (factory, connects)
    }
}

#[async_trait]
impl ChannelFactory for ResolvingFactory {
    type Channel = Arc<DiscoveredChannel>;

    async fn connect(&self) -> Result<Self::Channel> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let channel =
            DiscoveredChannel::open(target(), Some(self.backend.clone()), CONNECT_TIMEOUT).await?;
        Ok(Arc::new(channel))
    }

    async fn probe(&self, channel: &Self::Channel) -> Result<()> {
        channel.pick_ready(CONNECT_TIMEOUT).await.map(|_| ())
    }

    fn is_terminal(&self, channel: &Self::Channel) -> bool {
        channel.is_terminal()
    }

    fn close(&self, channel: &Self::Channel) {
        channel.close();
    }
}

async fn pick_port(channel: Arc<DiscoveredChannel>) -> std::result::Result<u16, Status> {
    channel
        .pick()
        .await
        .map(|(address, _)| address.port)
        .map_err(|e| Status::unavailable(e.to_string()))
}

/// A local port nothing listens on
async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test(start_paused = true)]
async fn test_broken_watch_recovers_with_fresh_channel() {
    let store = MemoryStore::new();
    let registrar = registrar(&store);
    let old_server = registrar
        .register(SERVICE, address(9600), Duration::from_secs(5))
        .await
        .unwrap();

    let (factory, connects) = ResolvingFactory::new(&store);
    let controller = ReconnectController::connect(factory, ReconnectConfig::default())
        .await
        .unwrap();
    assert_eq!(controller.call(pick_port).await.unwrap(), 9600);

    // The store connection drops while the backend restarts on a new port
    store.fail_watches("connection reset").await;
    registrar.release(old_server).await.unwrap();
    let _new_server = registrar
        .register(SERVICE, address(9601), Duration::from_secs(5))
        .await
        .unwrap();

    let mut rx = controller.channel().await.unwrap().subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|r| r.is_terminal()))
        .await
        .unwrap()
        .unwrap();

    let port = controller.call(pick_port).await.unwrap();
    assert_eq!(port, 9601);
    assert_eq!(controller.state(), ConnectionState::Connected);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_state_transitions_are_observable() {
    let store = MemoryStore::new();
    let _server = registrar(&store)
        .register(SERVICE, address(9610), Duration::from_secs(5))
        .await
        .unwrap();

    let (factory, connects) = ResolvingFactory::new(&store);
    let controller = Arc::new(
        ReconnectController::connect(factory, ReconnectConfig::default())
            .await
            .unwrap(),
    );
    let mut states = controller.subscribe_state();

    let caller = {
        let controller = Arc::clone(&controller);
        let failed_once = Arc::new(AtomicU64::new(0));
        tokio::spawn(async move {
            controller
                .call(move |channel| {
                    let first = failed_once.fetch_add(1, Ordering::SeqCst) == 0;
                    async move {
                        if first {
                            Err(Status::unavailable("backend restarted"))
                        } else {
                            pick_port(channel).await
                        }
                    }
                })
                .await
        })
    };

    states
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();
    assert_eq!(caller.await.unwrap().unwrap(), 9610);
    assert_eq!(controller.state(), ConnectionState::Connected);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unreachable_backend_exhausts_attempts() {
    let port = closed_port().await;
    let store = MemoryStore::new();
    let _server = registrar(&store)
        .register(SERVICE, Address::new("127.0.0.1", port), Duration::from_secs(30))
        .await
        .unwrap();

    let factory = DiscoveryChannelFactory::new(target(), Some(backend(&store)), CONNECT_TIMEOUT);
    let config = ReconnectConfig {
        initial_backoff_ms: 10,
        multiplier: 2.0,
        max_backoff_ms: 40,
        max_attempts: 3,
    };
    let controller = ReconnectController::connect(factory, config).await.unwrap();
    assert_eq!(controller.state(), ConnectionState::Connected);

    let result: Result<()> = controller
        .call(|_| async { Err(Status::unavailable("connection refused")) })
        .await;

    assert!(matches!(
        result,
        Err(Error::ReconnectExhausted { attempts: 3, .. })
    ));
    assert_eq!(controller.state(), ConnectionState::Failed);
    assert!(matches!(
        controller.channel().await,
        Err(Error::ReconnectExhausted { .. })
    ));
}

#[tokio::test]
async fn test_static_target_needs_no_backend() {
    let factory = DiscoveryChannelFactory::new(
        Target::Static(address(9620)),
        None,
        CONNECT_TIMEOUT,
    );
    let controller = ReconnectController::connect(factory, ReconnectConfig::default())
        .await
        .unwrap();

    let port = controller.call(pick_port).await.unwrap();
    assert_eq!(port, 9620);
}

#[tokio::test]
async fn test_discovery_target_without_backend_is_rejected() {
    let factory = DiscoveryChannelFactory::new(target(), None, CONNECT_TIMEOUT);
    let result = ReconnectController::connect(factory, ReconnectConfig::default()).await;
    assert!(matches!(result, Err(Error::InvalidTarget(_))));
}

#[tokio::test]
async fn test_closed_controller_rejects_calls() {
    let factory = DiscoveryChannelFactory::new(
        Target::Static(address(9630)),
        None,
        CONNECT_TIMEOUT,
    );
    let controller = ReconnectController::connect(factory, ReconnectConfig::default())
        .await
        .unwrap();

    controller.close().await;

    let result = controller.call(pick_port).await;
    assert!(matches!(result, Err(Error::Closed)));
}

async fn wait_for_watchers(store: &MemoryStore, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.watcher_count().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_replaced_and_closed_channels_release_watches() {
    let store = MemoryStore::new();
    let _server = registrar(&store)
        .register(SERVICE, address(9640), Duration::from_secs(5))
        .await
        .unwrap();

    let (factory, connects) = ResolvingFactory::new(&store);
    let controller = ReconnectController::connect(factory, ReconnectConfig::default())
        .await
        .unwrap();
    assert_eq!(store.watcher_count().await, 1);

    let failed_once = Arc::new(AtomicU64::new(0));
    let port = controller
        .call(move |channel| {
            let first = failed_once.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    Err(Status::unavailable("backend restarted"))
                } else {
                    pick_port(channel).await
                }
            }
        })
        .await
        .unwrap();
    assert_eq!(port, 9640);
    assert_eq!(connects.load(Ordering::SeqCst), 2);

    // Only the replacement channel still watches
    wait_for_watchers(&store, 1).await;

    controller.close().await;
    wait_for_watchers(&store, 0).await;
    assert_eq!(controller.state(), ConnectionState::Closed);
}
