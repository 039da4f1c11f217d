//! Prometheus metrics for the allocation engine

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics collector for interface lifecycle events
#[derive(Clone)]
pub struct EngineMetrics {
    /// Interfaces created and attached
    pub provision_total: IntCounter,
    /// Provisions that gave up, including policy errors
    pub provision_failures_total: IntCounter,
    /// Interfaces detached and deleted
    pub release_total: IntCounter,
    /// Releases that failed against the control plane
    pub release_failures_total: IntCounter,
    /// Reconciliation passes that hit the per-instance interface limit
    pub capacity_exhausted_total: IntCounter,
    /// Leasable addresses across attached interfaces
    pub address_capacity: IntGauge,
    /// Addresses currently leased to workloads
    pub addresses_leased: IntGauge,
    /// Addresses required by workloads at the last reconciliation
    pub address_demand: IntGauge,
    /// Interfaces tracked by the pool
    pub interfaces: IntGauge,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let provision_total =
            IntCounter::new("eni_provision_total", "Secondary interfaces provisioned")?;
        let provision_failures_total = IntCounter::new(
            "eni_provision_failures_total",
            "Secondary interface provisions that failed",
        )?;
        let release_total =
            IntCounter::new("eni_release_total", "Secondary interfaces released")?;
        let release_failures_total = IntCounter::new(
            "eni_release_failures_total",
            "Secondary interface releases that failed",
        )?;
        let capacity_exhausted_total = IntCounter::new(
            "eni_capacity_exhausted_total",
            "Reconciliations limited by the interface limit",
        )?;
        let address_capacity =
            IntGauge::new("eni_address_capacity", "Leasable addresses on the node")?;
        let addresses_leased =
            IntGauge::new("eni_addresses_leased", "Addresses leased to workloads")?;
        let address_demand =
            IntGauge::new("eni_address_demand", "Addresses required by workloads")?;
        let interfaces = IntGauge::new("eni_interfaces", "Interfaces tracked by the pool")?;

        registry.register(Box::new(provision_total.clone()))?;
        registry.register(Box::new(provision_failures_total.clone()))?;
        registry.register(Box::new(release_total.clone()))?;
        registry.register(Box::new(release_failures_total.clone()))?;
        registry.register(Box::new(capacity_exhausted_total.clone()))?;
        registry.register(Box::new(address_capacity.clone()))?;
        registry.register(Box::new(addresses_leased.clone()))?;
        registry.register(Box::new(address_demand.clone()))?;
        registry.register(Box::new(interfaces.clone()))?;

        Ok(Self {
            provision_total,
            provision_failures_total,
            release_total,
            release_failures_total,
            capacity_exhausted_total,
            address_capacity,
            addresses_leased,
            address_demand,
            interfaces,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_text_format_structure() {
        let metrics = EngineMetrics::new().expect("Failed to create metrics");
        metrics.provision_total.inc();
        metrics.address_capacity.set(42);

        let text = metrics.gather().expect("Failed to gather metrics");
        assert!(text.contains("# HELP eni_provision_total"));
        assert!(text.contains("# TYPE eni_address_capacity gauge"));
        assert!(text.contains("eni_address_capacity 42"));
    }

    #[test]
    fn test_metrics_clone_shares_registry() {
        let metrics = EngineMetrics::new().expect("Failed to create metrics");
        let clone = metrics.clone();
        clone.release_total.inc();
        assert_eq!(metrics.release_total.get(), 1);
        assert!(metrics.gather().unwrap().contains("eni_release_total 1"));
    }
}
