//! Nacos backend against a mock Nacos server

use std::time::Duration;

use hello_discovery::discovery::{
    Address, DiscoveredChannel, DiscoveryBackend, NacosBackend, NacosConfig, ResolverHandle,
    ResolverStatus,
};
use hello_discovery::error::Error;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::fixtures::{
    wait_for_resolution, NACOS_INSTANCES_CHANGED_JSON, NACOS_INSTANCES_JSON, SERVICE,
};

const LIST_PATH: &str = "/nacos/v1/ns/instance/list";
const INSTANCE_PATH: &str = "/nacos/v1/ns/instance";

fn nacos(endpoint: &str) -> NacosBackend {
    NacosBackend::new(
        NacosConfig::new(endpoint)
            .with_poll_interval(Duration::from_millis(50))
            .with_timeout(Duration::from_secs(2)),
    )
    .unwrap()
}

fn instances(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "application/json")
}

fn host(ip: &str) -> Address {
    Address::new(ip, 9996)
}

// ============================================================================
// Resolution
// ============================================================================

#[tokio::test]
async fn test_initial_listing_skips_unhealthy_and_disabled() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(LIST_PATH))
        .and(query_param("serviceName", SERVICE))
        .and(query_param("healthyOnly", "true"))
        .respond_with(instances(NACOS_INSTANCES_JSON))
        .mount(&mock_server)
        .await;

    let backend = DiscoveryBackend::Nacos(nacos(&mock_server.uri()));
    let resolver = ResolverHandle::start(backend, SERVICE).await.unwrap();

    let resolution = resolver.current();
    assert_eq!(resolution.status, ResolverStatus::Healthy);
    assert_eq!(
        resolution.addresses.to_vec(),
        vec![host("10.0.0.1"), host("10.0.0.2")]
    );
}

#[tokio::test]
async fn test_polling_publishes_membership_changes() {
    let mock_server = MockServer::start().await;

    // Initial listing plus the first poll see the original set
    Mock::given(method("GET"))
        .and(path(LIST_PATH))
        .respond_with(instances(NACOS_INSTANCES_JSON))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(LIST_PATH))
        .respond_with(instances(NACOS_INSTANCES_CHANGED_JSON))
        .mount(&mock_server)
        .await;

    let backend = DiscoveryBackend::Nacos(nacos(&mock_server.uri()));
    let resolver = ResolverHandle::start(backend, SERVICE).await.unwrap();
    let initial_revision = resolver.current().revision;

    let mut rx = resolver.subscribe();
    let resolution = wait_for_resolution(&mut rx, |r| r.addresses.contains(&host("10.0.0.5"))).await;

    assert_eq!(
        resolution.addresses.to_vec(),
        vec![host("10.0.0.2"), host("10.0.0.5")]
    );
    assert!(resolution.revision > initial_revision);
    assert_eq!(resolution.status, ResolverStatus::Healthy);
}

#[tokio::test]
async fn test_poll_failure_fails_resolver() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(LIST_PATH))
        .respond_with(instances(NACOS_INSTANCES_JSON))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(LIST_PATH))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let backend = DiscoveryBackend::Nacos(nacos(&mock_server.uri()));
    let resolver = ResolverHandle::start(backend, SERVICE).await.unwrap();

    let mut rx = resolver.subscribe();
    let resolution = wait_for_resolution(&mut rx, |r| r.is_terminal()).await;

    assert!(matches!(resolution.status, ResolverStatus::Failed(_)));
    assert_eq!(resolution.addresses.len(), 2);
    assert!(matches!(resolution.error(), Some(Error::WatchStream(_))));
}

#[tokio::test]
async fn test_unreachable_server_fails_start() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let backend = DiscoveryBackend::Nacos(nacos(&endpoint));
    let result = ResolverHandle::start(backend, SERVICE).await;
    assert!(matches!(result, Err(Error::StoreUnavailable(_))));
}

#[tokio::test]
async fn test_nacos_target_balances_over_instances() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(LIST_PATH))
        .respond_with(instances(NACOS_INSTANCES_JSON))
        .mount(&mock_server)
        .await;

    let channel = DiscoveredChannel::open(
        format!("nacos://{SERVICE}").parse().unwrap(),
        Some(DiscoveryBackend::Nacos(nacos(&mock_server.uri()))),
        Duration::from_secs(1),
    )
    .await
    .unwrap();

    let first = channel.pick().await.unwrap().0;
    let second = channel.pick().await.unwrap().0;
    assert_ne!(first, second);
    assert_eq!(channel.target().service(), SERVICE);
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_register_and_deregister_instance() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(INSTANCE_PATH))
        .and(query_param("serviceName", SERVICE))
        .and(query_param("ip", "10.0.0.9"))
        .and(query_param("port", "9996"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("DELETE"))
        .and(path(INSTANCE_PATH))
        .and(query_param("serviceName", SERVICE))
        .and(query_param("ip", "10.0.0.9"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let backend = nacos(&mock_server.uri());
    let address = host("10.0.0.9");

    backend.register_instance(SERVICE, &address).await.unwrap();
    backend.deregister_instance(SERVICE, &address).await.unwrap();
}

#[tokio::test]
async fn test_register_rejected_by_server() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(INSTANCE_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("caused: no permission"))
        .mount(&mock_server)
        .await;

    let backend = nacos(&mock_server.uri());
    let result = backend.register_instance(SERVICE, &host("10.0.0.9")).await;
    assert!(result.is_err());
}
