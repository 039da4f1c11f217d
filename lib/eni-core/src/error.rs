use crate::cloud::CloudError;
use eni_api::InterfaceState;
use std::net::Ipv4Addr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Subnet catalog unavailable for network {network_id}: {source}")]
    CatalogUnavailable {
        network_id: String,
        #[source]
        source: CloudError,
    },

    #[error("No eligible subnet in network {network_id}: {reason}")]
    NoEligibleSubnet { network_id: String, reason: String },

    #[error("No subnets available in network {0}")]
    NoSubnetsAvailable(String),

    #[error("Provisioning in subnet {subnet_id} failed: {source}")]
    ProvisionFailed {
        subnet_id: String,
        #[source]
        source: CloudError,
    },

    #[error("Capacity exhausted: {in_use} of {limit} interfaces in use")]
    CapacityExhausted { in_use: usize, limit: usize },

    #[error("Release of {interface_id} aborted: {leased} addresses leased")]
    ReleaseConflict { interface_id: String, leased: usize },

    #[error("Release of {interface_id} would leave {remaining} addresses, {required} still needed")]
    CapacityNeeded {
        interface_id: String,
        remaining: usize,
        required: usize,
    },

    #[error("Release of {interface_id} failed: {source}")]
    ReleaseFailed {
        interface_id: String,
        #[source]
        source: CloudError,
    },

    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Primary interface {0} cannot be released")]
    PrimaryInterface(String),

    #[error("Invalid transition for {interface_id}: {from} -> {to}")]
    InvalidTransition {
        interface_id: String,
        from: InterfaceState,
        to: InterfaceState,
    },

    #[error("No free address on any attached interface")]
    NoFreeAddress,

    #[error("Address {0} is not leased")]
    AddressNotLeased(Ipv4Addr),

    #[error("Address {0} does not belong to a leasable interface")]
    UnknownAddress(Ipv4Addr),

    #[error("Demand signal unavailable: {0}")]
    DemandUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl EngineError {
    /// Policy and configuration errors need an operator; everything else is
    /// picked up again on the next reconciliation or GC pass.
    pub fn is_operator_actionable(&self) -> bool {
        matches!(
            self,
            EngineError::NoEligibleSubnet { .. }
                | EngineError::NoSubnetsAvailable(_)
                | EngineError::InvalidConfiguration(_)
        )
    }
}
