//! Secondary network interfaces and their lifecycle states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

/// Lifecycle state of an interface tracked by the pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterfaceState {
    /// Capacity reserved, no subnet chosen yet
    Requested,
    /// Create/attach issued against the control plane
    Creating,
    /// Attached to the instance, addresses leasable
    Attached,
    /// Marked for release, waiting to be detached
    DetachRequested,
    /// Detach/delete in flight
    Detaching,
    /// Removed from the instance and the cloud
    Deleted,
    /// An unretryable cloud error left the interface in an unknown state
    Error,
}

impl InterfaceState {
    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: InterfaceState) -> bool {
        use InterfaceState::*;

        match (self, next) {
            (Deleted, _) => false,
            (_, Error) => true,
            (Requested, Creating) | (Requested, Deleted) => true,
            (Creating, Attached) | (Creating, Deleted) => true,
            (Attached, DetachRequested) => true,
            (DetachRequested, Detaching) | (DetachRequested, Attached) => true,
            (Detaching, Deleted) | (Detaching, Attached) => true,
            (Error, Detaching) | (Error, Deleted) => true,
            _ => false,
        }
    }

    /// Only attached interfaces contribute leasable addresses
    pub fn counts_toward_capacity(self) -> bool {
        matches!(self, InterfaceState::Attached)
    }
}

impl fmt::Display for InterfaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterfaceState::Requested => "Requested",
            InterfaceState::Creating => "Creating",
            InterfaceState::Attached => "Attached",
            InterfaceState::DetachRequested => "DetachRequested",
            InterfaceState::Detaching => "Detaching",
            InterfaceState::Deleted => "Deleted",
            InterfaceState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// A network interface owned by the node
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Interface identifier (e.g. "eni-0a1b2c")
    pub id: String,

    /// Subnet the interface draws its addresses from; never changes
    pub subnet_id: String,

    /// Device slot on the instance (0 is the primary interface)
    pub device_index: u32,

    /// The boot-time primary interface is never released
    #[serde(default)]
    pub primary: bool,

    pub state: InterfaceState,

    /// Leasable addresses, ascending
    #[serde(default)]
    pub addresses: Vec<Ipv4Addr>,

    /// Addresses currently handed out to workloads
    #[serde(default)]
    pub leased: BTreeSet<Ipv4Addr>,

    /// When the interface last dropped to zero leases
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_since: Option<DateTime<Utc>>,

    /// When the state was last confirmed against the control plane
    pub observed_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl NetworkInterface {
    pub fn new(id: impl Into<String>, subnet_id: impl Into<String>, device_index: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            subnet_id: subnet_id.into(),
            device_index,
            primary: false,
            state: InterfaceState::Creating,
            addresses: Vec::new(),
            leased: BTreeSet::new(),
            idle_since: None,
            observed_at: now,
            last_error: None,
        }
    }

    pub fn has_leases(&self) -> bool {
        !self.leased.is_empty()
    }

    /// Number of leasable addresses this interface contributes
    pub fn capacity(&self) -> usize {
        if self.state.counts_toward_capacity() {
            self.addresses.len()
        } else {
            0
        }
    }

    /// Lowest address not yet leased
    pub fn next_free_address(&self) -> Option<Ipv4Addr> {
        self.addresses
            .iter()
            .find(|addr| !self.leased.contains(addr))
            .copied()
    }

    pub fn owns_address(&self, address: &Ipv4Addr) -> bool {
        self.addresses.binary_search(address).is_ok()
    }
}

/// Point-in-time view of a node's interface pool
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub instance_id: String,
    pub network_id: String,
    pub capacity: usize,
    pub leased: usize,
    pub pending_provisions: usize,
    pub interfaces: Vec<NetworkInterface>,
}
