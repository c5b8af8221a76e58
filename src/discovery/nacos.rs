//! Nacos naming service backend
//!
//! Nacos has no revisioned watch, so changes are detected by polling the
//! instance list and diffing it against the last known set. Each non-empty
//! diff becomes one [`ChangeBatch`] with a synthetic revision that grows by
//! one per batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::address::{Address, AddressChange, AddressSet};
use super::backend::{ChangeBatch, ChangeStream, Snapshot};
use crate::error::{Error, Result};
use crate::store::Revision;

// ============================================================================
// Nacos Configuration
// ============================================================================

/// Configuration for the Nacos backend
#[derive(Debug, Clone)]
pub struct NacosConfig {
    /// Server URL, e.g. `http://127.0.0.1:8848`
    pub endpoint: String,

    /// How often the instance list is polled
    pub poll_interval: Duration,

    /// HTTP request timeout
    pub timeout: Duration,
}

impl NacosConfig {
    /// Create a config for `endpoint` with default timings
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(5),
        }
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ============================================================================
// API Types
// ============================================================================

/// Response of `GET /nacos/v1/ns/instance/list`
#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    hosts: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
struct Instance {
    ip: String,
    port: u16,

    #[serde(default = "default_true")]
    healthy: bool,

    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Last listing per service, used as the diff baseline for watches
#[derive(Debug, Default)]
struct Baseline {
    revision: Revision,
    addresses: AddressSet,
}

// ============================================================================
// Nacos Backend
// ============================================================================

/// Discovery backend over the Nacos open API
#[derive(Clone)]
pub struct NacosBackend {
    config: NacosConfig,
    http_client: Client,
    baselines: Arc<Mutex<HashMap<String, Baseline>>>,
}

impl NacosBackend {
    /// Create a new Nacos backend
    pub fn new(config: NacosConfig) -> Result<Self> {
        let http_client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            config,
            http_client,
            baselines: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    /// Fetch the healthy, enabled instances of `service`
    async fn fetch(&self, service: &str) -> Result<AddressSet> {
        let response = self
            .http_client
            .get(self.url("/nacos/v1/ns/instance/list"))
            .query(&[("serviceName", service), ("healthyOnly", "true")])
            .send()
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?
            .error_for_status()?;

        let list: InstanceList = response.json().await?;
        Ok(list
            .hosts
            .into_iter()
            .filter(|instance| instance.healthy && instance.enabled)
            .map(|instance| Address::new(instance.ip, instance.port))
            .collect())
    }

    pub(super) async fn list(&self, service: &str) -> Result<Snapshot> {
        let addresses = self.fetch(service).await?;

        let mut baselines = self.baselines.lock().await;
        let baseline = baselines.entry(service.to_string()).or_default();
        baseline.revision += 1;
        baseline.addresses = addresses.clone();

        Ok(Snapshot {
            addresses: addresses.to_vec(),
            revision: baseline.revision,
        })
    }

    pub(super) async fn watch(&self, service: &str, from_revision: Revision) -> Result<ChangeStream> {
        let known = {
            let baselines = self.baselines.lock().await;
            match baselines.get(service) {
                Some(baseline) if baseline.revision + 1 == from_revision => {
                    baseline.addresses.clone()
                }
                // No matching listing; start from nothing so the first poll
                // reports every instance as a PUT.
                _ => AddressSet::new(),
            }
        };

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let state = PollState {
            backend: self.clone(),
            service: service.to_string(),
            known,
            revision: from_revision - 1,
            ticker,
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }

            loop {
                state.ticker.tick().await;

                let current = match state.backend.fetch(&state.service).await {
                    Ok(current) => current,
                    Err(e) => {
                        state.done = true;
                        let err = Error::WatchStream(format!("nacos poll failed: {e}"));
                        return Some((Err(err), state));
                    }
                };

                let changes = diff(&state.known, &current);
                if changes.is_empty() {
                    continue;
                }

                state.known = current;
                state.revision += 1;
                let batch = ChangeBatch {
                    revision: state.revision,
                    changes,
                };
                return Some((Ok(batch), state));
            }
        });

        Ok(stream.boxed())
    }

    /// Register a persistent instance of `service`
    pub async fn register_instance(&self, service: &str, address: &Address) -> Result<()> {
        let port = address.port.to_string();
        self.http_client
            .post(self.url("/nacos/v1/ns/instance"))
            .query(&[
                ("serviceName", service),
                ("ip", address.host.as_str()),
                ("port", port.as_str()),
                ("ephemeral", "false"),
            ])
            .send()
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?
            .error_for_status()?;

        tracing::info!(service = %service, address = %address, "Registered nacos instance");
        Ok(())
    }

    /// Remove a previously registered instance
    pub async fn deregister_instance(&self, service: &str, address: &Address) -> Result<()> {
        let port = address.port.to_string();
        self.http_client
            .delete(self.url("/nacos/v1/ns/instance"))
            .query(&[
                ("serviceName", service),
                ("ip", address.host.as_str()),
                ("port", port.as_str()),
                ("ephemeral", "false"),
            ])
            .send()
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?
            .error_for_status()?;

        tracing::info!(service = %service, address = %address, "Deregistered nacos instance");
        Ok(())
    }
}

struct PollState {
    backend: NacosBackend,
    service: String,
    known: AddressSet,
    revision: Revision,
    ticker: tokio::time::Interval,
    done: bool,
}

/// Changes turning `before` into `after`, deletes first
fn diff(before: &AddressSet, after: &AddressSet) -> Vec<AddressChange> {
    let deletes = before
        .iter()
        .filter(|a| !after.contains(a))
        .cloned()
        .map(AddressChange::Delete);
    let puts = after
        .iter()
        .filter(|a| !before.contains(a))
        .cloned()
        .map(AddressChange::Put);
    deletes.chain(puts).collect()
}
