//! Shared fixture for pool, lease, reconciler and GC tests

use crate::config::EngineConfig;
use crate::memory::MemoryCloud;
use crate::metrics::EngineMetrics;
use crate::pool::InterfacePool;
use crate::retry::RetryPolicy;
use eni_api::{Network, Subnet, CNI_ELIGIBLE_TAG};
use std::sync::Arc;

const INSTANCE_ID: &str = "i-test";

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        call_timeout_ms: 1_000,
        jitter: false,
    }
}

/// A `10.0.0.0/16` network with an untagged primary subnet, two candidate
/// subnets (tagged or not) and one subnet from a secondary block outside the
/// network's declared CIDR.
pub(crate) struct Fixture {
    pub cloud: Arc<MemoryCloud>,
    pub pool: Arc<InterfacePool>,
    pub config: EngineConfig,
    subnets: Vec<Subnet>,
}

impl Fixture {
    pub async fn tagged() -> Self {
        Self::build(true, |_| {}).await
    }

    pub async fn untagged() -> Self {
        Self::build(false, |_| {}).await
    }

    /// Build a fixture with a bootstrapped pool
    pub async fn build(tagged: bool, configure: impl FnOnce(&mut EngineConfig)) -> Self {
        let mut config = EngineConfig {
            instance_id: INSTANCE_ID.to_string(),
            max_interfaces: 4,
            addresses_per_interface: 10,
            cloud_retry: fast_retry(),
            catalog_retry: fast_retry(),
            ..EngineConfig::default()
        };
        configure(&mut config);

        let candidate = |id: &str, cidr: &str| {
            let subnet = Subnet::new(id, "vpc-1", cidr.parse().unwrap());
            if tagged {
                subnet.with_tag(CNI_ELIGIBLE_TAG, "1")
            } else {
                subnet
            }
        };
        let subnets = vec![
            Subnet::new("subnet-primary", "vpc-1", "10.0.0.0/20".parse().unwrap()),
            candidate("subnet-pods-a", "10.0.64.0/18"),
            candidate("subnet-pods-b", "10.0.128.0/19"),
            Subnet::new("subnet-overflow", "vpc-1", "100.64.0.0/24".parse().unwrap()),
        ];

        let cloud = Arc::new(MemoryCloud::new());
        cloud.add_network(Network::new("vpc-1", "10.0.0.0/16".parse().unwrap()));
        for subnet in &subnets {
            cloud.add_subnet(subnet.clone());
        }
        cloud
            .add_instance(
                INSTANCE_ID,
                "subnet-primary",
                config.max_interfaces,
                config.addresses_per_interface,
            )
            .unwrap();

        let pool = Arc::new(build_pool(&cloud, config.clone()));
        pool.bootstrap().await.unwrap();
        Self {
            cloud,
            pool,
            config,
            subnets,
        }
    }

    /// A second, unbootstrapped pool against the same cloud
    pub fn new_pool(&self) -> InterfacePool {
        build_pool(&self.cloud, self.config.clone())
    }

    /// An unbootstrapped pool with an adjusted config
    pub fn pool_with(&self, configure: impl FnOnce(&mut EngineConfig)) -> InterfacePool {
        let mut config = self.config.clone();
        configure(&mut config);
        build_pool(&self.cloud, config)
    }

    /// Subnets carrying the eligibility tag
    pub fn tagged_ids(&self) -> Vec<String> {
        self.subnets
            .iter()
            .filter(|s| s.has_tag(CNI_ELIGIBLE_TAG))
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn subnet(&self, subnet_id: &str) -> Subnet {
        self.subnets
            .iter()
            .find(|s| s.id == subnet_id)
            .cloned()
            .unwrap()
    }
}

fn build_pool(cloud: &Arc<MemoryCloud>, config: EngineConfig) -> InterfacePool {
    InterfacePool::from_config(cloud.clone(), config, EngineMetrics::new().unwrap())
}
