//! Address lease interface used by the node's IP allocator

use crate::pool::InterfacePool;
use crate::{EngineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use eni_api::{InterfaceState, NetworkInterface};
use serde::Serialize;
use std::net::Ipv4Addr;
use tracing::debug;

/// An address handed to a workload, bound to the interface that owns it
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub address: Ipv4Addr,
    pub interface_id: String,
    pub subnet_id: String,
}

impl Lease {
    fn from_interface(iface: &NetworkInterface, address: Ipv4Addr) -> Self {
        Self {
            address,
            interface_id: iface.id.clone(),
            subnet_id: iface.subnet_id.clone(),
        }
    }
}

#[async_trait]
pub trait AddressLease: Send + Sync {
    /// Lease a free address from an attached interface
    async fn lease_address(&self) -> Result<Lease>;

    /// Return a leased address to its interface
    async fn release_address(&self, address: Ipv4Addr) -> Result<()>;

    /// Record a specific address as leased, e.g. for a pod that was already
    /// running when the agent started
    async fn claim_address(&self, address: Ipv4Addr) -> Result<Lease>;
}

#[async_trait]
impl AddressLease for InterfacePool {
    async fn lease_address(&self) -> Result<Lease> {
        let mut guard = self.state.lock().await;
        // Fill the primary and low device indexes first so that the highest
        // interfaces drain and become reclaimable.
        let iface = guard
            .interfaces
            .values_mut()
            .filter(|iface| iface.state == InterfaceState::Attached)
            .filter(|iface| iface.next_free_address().is_some())
            .min_by_key(|iface| (!iface.primary, iface.device_index))
            .ok_or(EngineError::NoFreeAddress)?;

        let address = iface.next_free_address().ok_or(EngineError::NoFreeAddress)?;
        iface.leased.insert(address);
        iface.idle_since = None;
        let lease = Lease::from_interface(iface, address);
        debug!(%address, interface_id = %lease.interface_id, "leased address");

        let leased: usize = guard.interfaces.values().map(|i| i.leased.len()).sum();
        self.metrics().addresses_leased.set(leased as i64);
        Ok(lease)
    }

    async fn release_address(&self, address: Ipv4Addr) -> Result<()> {
        let mut guard = self.state.lock().await;
        let iface = guard
            .interfaces
            .values_mut()
            .find(|iface| iface.leased.contains(&address))
            .ok_or(EngineError::AddressNotLeased(address))?;

        iface.leased.remove(&address);
        if iface.leased.is_empty() {
            iface.idle_since = Some(Utc::now());
        }
        debug!(%address, interface_id = %iface.id, "released address");

        let leased: usize = guard.interfaces.values().map(|i| i.leased.len()).sum();
        self.metrics().addresses_leased.set(leased as i64);
        Ok(())
    }

    async fn claim_address(&self, address: Ipv4Addr) -> Result<Lease> {
        let mut guard = self.state.lock().await;
        let iface = guard
            .interfaces
            .values_mut()
            .filter(|iface| {
                matches!(
                    iface.state,
                    InterfaceState::Attached | InterfaceState::DetachRequested
                )
            })
            .find(|iface| iface.owns_address(&address))
            .ok_or(EngineError::UnknownAddress(address))?;

        iface.leased.insert(address);
        iface.idle_since = None;
        let lease = Lease::from_interface(iface, address);
        debug!(%address, interface_id = %lease.interface_id, "claimed address");

        let leased: usize = guard.interfaces.values().map(|i| i.leased.len()).sum();
        self.metrics().addresses_leased.set(leased as i64);
        Ok(lease)
    }
}
