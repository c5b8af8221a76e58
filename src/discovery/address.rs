//! Resolved endpoints and the address set
//!
//! Store keys follow the layout `"<service>/" + schemeAddress`, for example
//! `hello-grpc/grpc://10.0.0.5:9996`. The scheme is informational; two keys
//! that differ only in scheme name the same [`Address`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Scheme written by the registrar when none is configured
pub const DEFAULT_SCHEME: &str = "grpc";

// ============================================================================
// Address
// ============================================================================

/// A single resolved endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    /// Create a new address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Render with a scheme, e.g. `grpc://10.0.0.5:9996`
    pub fn with_scheme(&self, scheme: &str) -> String {
        format!("{scheme}://{self}")
    }

    /// URI used to build a transport endpoint
    pub fn endpoint_uri(&self) -> String {
        self.with_scheme("http")
    }

    /// Store key for this address under `service`
    pub fn store_key(&self, service: &str, scheme: &str) -> String {
        format!("{}{}", service_prefix(service), self.with_scheme(scheme))
    }

    /// Parse the address out of a store key under `service`
    ///
    /// Keys from other services are rejected rather than guessed at.
    pub fn from_store_key(service: &str, key: &str) -> Result<Self> {
        let prefix = service_prefix(service);
        let rest = key
            .strip_prefix(&prefix)
            .ok_or_else(|| Error::InvalidAddress(format!("key '{key}' is outside '{prefix}'")))?;
        rest.parse()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Accepts `scheme://host:port` as well as bare `host:port`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let with_scheme = if s.contains("://") {
            s.to_string()
        } else {
            format!("{DEFAULT_SCHEME}://{s}")
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| Error::InvalidAddress(format!("'{s}': {e}")))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidAddress(format!("'{s}': missing host")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidAddress(format!("'{s}': missing port")))?;

        Ok(Self::new(host, port))
    }
}

/// Key prefix shared by every instance of `service`
pub fn service_prefix(service: &str) -> String {
    format!("{}/", service.trim_end_matches('/'))
}

// ============================================================================
// Address Set
// ============================================================================

/// Change applied to an [`AddressSet`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressChange {
    Put(Address),
    Delete(Address),
}

/// The believed-live addresses of one service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    addresses: BTreeSet<Address>,
}

impl AddressSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address; returns false if it was already present
    pub fn insert(&mut self, address: Address) -> bool {
        self.addresses.insert(address)
    }

    /// Remove an address; returns false if it was not present
    pub fn remove(&mut self, address: &Address) -> bool {
        self.addresses.remove(address)
    }

    /// Apply a change, reporting whether the set was modified
    pub fn apply(&mut self, change: &AddressChange) -> bool {
        match change {
            AddressChange::Put(address) => self.insert(address.clone()),
            AddressChange::Delete(address) => self.remove(address),
        }
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.addresses.contains(address)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Addresses in a stable order
    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.addresses.iter()
    }

    pub fn to_vec(&self) -> Vec<Address> {
        self.addresses.iter().cloned().collect()
    }
}

impl FromIterator<Address> for AddressSet {
    fn from_iter<I: IntoIterator<Item = Address>>(iter: I) -> Self {
        Self {
            addresses: iter.into_iter().collect(),
        }
    }
}
