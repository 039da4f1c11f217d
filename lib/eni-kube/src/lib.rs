//! Kubernetes integration for the allocation engine
//!
//! Supplies the node's address demand from its scheduled pods and resolves
//! the node's cloud instance id.

pub mod demand;
pub mod error;
pub mod node;

pub use demand::{pod_needs_address, PodDemandSource};
pub use error::{KubeError, Result};
pub use node::{node_instance_id, parse_provider_id};
