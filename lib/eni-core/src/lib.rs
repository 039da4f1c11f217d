//! Secondary-interface subnet allocation engine
//!
//! This library provides:
//! - Subnet catalog and tag-aware subnet selection
//! - The interface pool and its lifecycle state machine
//! - Address leasing for the node's IP allocator
//! - Demand reconciliation and idle-interface garbage collection
//! - A simulated cloud control plane

pub mod catalog;
pub mod cloud;
pub mod config;
pub mod error;
pub mod gc;
pub mod lease;
pub mod memory;
pub mod metrics;
pub mod pool;
pub mod reconciler;
pub mod retry;
pub mod selector;

#[cfg(test)]
mod test_support;

pub use catalog::{CatalogSnapshot, SubnetCatalog};
pub use cloud::{CloudControlPlane, CloudError};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use gc::GarbageCollector;
pub use lease::{AddressLease, Lease};
pub use memory::MemoryCloud;
pub use metrics::EngineMetrics;
pub use pool::InterfacePool;
pub use reconciler::{DemandReconciler, DemandSource, StaticDemand};
pub use retry::RetryPolicy;
pub use selector::{SubnetSelector, TieBreak};
