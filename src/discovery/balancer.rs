//! Round-robin balancer
//!
//! Keeps one lazily connected `tonic` channel per resolved address. When the
//! address set changes, channels for surviving addresses are kept and only
//! new addresses get a fresh channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use super::address::{Address, AddressSet};
use crate::error::Result;

/// Round-robin picker over per-address channels
pub struct RoundRobin {
    connect_timeout: Duration,
    order: Vec<Address>,
    channels: HashMap<Address, Channel>,
    next: AtomicUsize,
}

impl RoundRobin {
    /// Create an empty balancer
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            order: Vec::new(),
            channels: HashMap::new(),
            next: AtomicUsize::new(0),
        }
    }

    /// Build a lazy endpoint channel for `address`
    pub fn endpoint(address: &Address, connect_timeout: Duration) -> Result<Endpoint> {
        Ok(Endpoint::from_shared(address.endpoint_uri())?.connect_timeout(connect_timeout))
    }

    /// Replace the address list, reusing channels for addresses that remain
    pub fn update(&mut self, addresses: &AddressSet) -> Result<()> {
        let mut channels = HashMap::with_capacity(addresses.len());

        for address in addresses.iter() {
            let channel = match self.channels.remove(address) {
                Some(channel) => channel,
                None => {
                    tracing::debug!(address = %address, "Creating channel");
                    Self::endpoint(address, self.connect_timeout)?.connect_lazy()
                }
            };
            channels.insert(address.clone(), channel);
        }

        for address in self.channels.keys() {
            tracing::debug!(address = %address, "Dropping channel");
        }

        self.order = addresses.to_vec();
        self.channels = channels;
        Ok(())
    }

    /// Next address and its channel, or `None` when empty
    pub fn pick(&self) -> Option<(Address, Channel)> {
        if self.order.is_empty() {
            return None;
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.order.len();
        let address = &self.order[index];
        self.channels
            .get(address)
            .map(|channel| (address.clone(), channel.clone()))
    }

    /// Addresses in pick order
    pub fn addresses(&self) -> &[Address] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
