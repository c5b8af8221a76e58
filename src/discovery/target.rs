//! Channel targets
//!
//! A target names what a client connects to:
//!
//! - `etcd:///<service>` resolves through the coordination store
//! - `nacos://<service>` resolves through a Nacos server
//! - `host:port` is a single static address

use std::fmt;
use std::str::FromStr;

use super::address::Address;
use crate::config::{DiscoveryConfig, DiscoveryKind};
use crate::error::{Error, Result};

/// What a channel resolves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Etcd { service: String },
    Nacos { service: String },
    Static(Address),
}

impl Target {
    /// Target implied by the discovery configuration
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        let service = config.service_name.clone();
        match config.discovery {
            Some(DiscoveryKind::Etcd) => Self::Etcd { service },
            Some(DiscoveryKind::Nacos) => Self::Nacos { service },
            None => Self::Static(config.static_address()),
        }
    }

    /// Service name, or the address for static targets
    pub fn service(&self) -> String {
        match self {
            Self::Etcd { service } | Self::Nacos { service } => service.clone(),
            Self::Static(address) => address.to_string(),
        }
    }

    /// Backend this target needs, if any
    pub fn discovery_kind(&self) -> Option<DiscoveryKind> {
        match self {
            Self::Etcd { .. } => Some(DiscoveryKind::Etcd),
            Self::Nacos { .. } => Some(DiscoveryKind::Nacos),
            Self::Static(_) => None,
        }
    }
}

fn parse_service(target: &str, rest: &str) -> Result<String> {
    let service = rest.trim_start_matches('/').trim_end_matches('/');
    if service.is_empty() || service.contains('/') {
        return Err(Error::InvalidTarget(format!(
            "'{target}': expected exactly one service name"
        )));
    }
    Ok(service.to_string())
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("etcd://") {
            return Ok(Self::Etcd {
                service: parse_service(s, rest)?,
            });
        }
        if let Some(rest) = s.strip_prefix("nacos://") {
            return Ok(Self::Nacos {
                service: parse_service(s, rest)?,
            });
        }

        s.parse::<Address>()
            .map(Self::Static)
            .map_err(|e| Error::InvalidTarget(format!("'{s}': {e}")))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Etcd { service } => write!(f, "etcd:///{service}"),
            Self::Nacos { service } => write!(f, "nacos://{service}"),
            Self::Static(address) => write!(f, "{address}"),
        }
    }
}
