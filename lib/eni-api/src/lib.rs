//! Shared data model for the secondary-interface allocation engine
//!
//! This library defines the types exchanged between the engine, its cloud
//! collaborators and the node agent's introspection API:
//! - Subnet / Network: placement inputs read from the cloud control plane
//! - NetworkInterface / InterfaceState: the node's interface pool entries
//! - PoolStatus: a point-in-time view of the pool served over HTTP

pub mod interface;
pub mod subnet;

pub use interface::{InterfaceState, NetworkInterface, PoolStatus};
pub use subnet::{Network, Subnet, CNI_ELIGIBLE_TAG};
