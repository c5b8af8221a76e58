//! Configuration from process environment variables
//!
//! These tests mutate the process environment and run serially.

use std::env;

use hello_discovery::config::{
    Config, ConfigError, DiscoveryKind, ENV_BACKEND, ENV_BACKEND_PORT, ENV_DISCOVERY,
    ENV_DISCOVERY_ENDPOINT, ENV_SERVER, ENV_SERVER_PORT,
};
use hello_discovery::discovery::{Address, Target};
use serial_test::serial;

const ALL_VARS: [&str; 6] = [
    ENV_DISCOVERY,
    ENV_DISCOVERY_ENDPOINT,
    ENV_SERVER,
    ENV_SERVER_PORT,
    ENV_BACKEND,
    ENV_BACKEND_PORT,
];

/// Clears every variable on creation and again on drop
struct EnvGuard;

impl EnvGuard {
    fn new() -> Self {
        clear();
        Self
    }

    fn set(&self, key: &str, value: &str) {
        env::set_var(key, value);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        clear();
    }
}

fn clear() {
    for key in ALL_VARS {
        env::remove_var(key);
    }
}

#[test]
#[serial]
fn test_unset_discovery_means_static_addressing() {
    let _vars = EnvGuard::new();

    let config = Config::from_env().unwrap();
    assert_eq!(config.discovery.discovery, None);
    assert_eq!(
        Target::from_config(&config.discovery),
        Target::Static(Address::new("localhost", 9996))
    );
}

#[test]
#[serial]
fn test_etcd_discovery_from_env() {
    let vars = EnvGuard::new();
    vars.set(ENV_DISCOVERY, "etcd");
    vars.set(ENV_DISCOVERY_ENDPOINT, "10.1.0.7:2379");

    let config = Config::from_env().unwrap();
    assert_eq!(config.discovery.discovery, Some(DiscoveryKind::Etcd));
    assert_eq!(config.discovery.endpoints(), vec!["http://10.1.0.7:2379"]);

    let target = Target::from_config(&config.discovery);
    assert_eq!(target.to_string(), "etcd:///hello-grpc");
}

#[test]
#[serial]
fn test_nacos_discovery_from_env() {
    let vars = EnvGuard::new();
    vars.set(ENV_DISCOVERY, "NACOS");
    vars.set(ENV_DISCOVERY_ENDPOINT, "http://nacos.local:8848");

    let config = Config::from_env().unwrap();
    assert_eq!(config.discovery.discovery, Some(DiscoveryKind::Nacos));

    let target = Target::from_config(&config.discovery);
    assert_eq!(target.to_string(), "nacos://hello-grpc");
}

#[test]
#[serial]
fn test_unknown_discovery_rejected() {
    let vars = EnvGuard::new();
    vars.set(ENV_DISCOVERY, "consul");

    let result = Config::from_env();
    assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
}

#[test]
#[serial]
fn test_backend_overrides_server_address() {
    let vars = EnvGuard::new();
    vars.set(ENV_SERVER, "0.0.0.0");
    vars.set(ENV_SERVER_PORT, "8881");
    vars.set(ENV_BACKEND, "hello-backend");

    let config = Config::from_env().unwrap();
    assert_eq!(
        config.discovery.static_address(),
        Address::new("hello-backend", 8881)
    );

    vars.set(ENV_BACKEND_PORT, "9000");
    let config = Config::from_env().unwrap();
    assert_eq!(
        config.discovery.static_address(),
        Address::new("hello-backend", 9000)
    );
}

#[test]
#[serial]
fn test_invalid_port_rejected() {
    let vars = EnvGuard::new();
    vars.set(ENV_SERVER_PORT, "not-a-port");

    assert!(Config::from_env().is_err());
}
