//! Subnet catalog backed by the cloud control plane

use crate::cloud::CloudControlPlane;
use crate::retry::{retry_cloud, RetryPolicy};
use crate::{EngineError, Result};
use chrono::{DateTime, Utc};
use eni_api::{Network, Subnet};
use std::sync::Arc;
use tracing::debug;

/// Subnets of one network as read from the control plane at `fetched_at`
#[derive(Clone, Debug)]
pub struct CatalogSnapshot {
    pub network: Network,
    /// Ordered by subnet id
    pub subnets: Vec<Subnet>,
    pub fetched_at: DateTime<Utc>,
}

impl CatalogSnapshot {
    pub fn new(network: Network, mut subnets: Vec<Subnet>) -> Self {
        subnets.retain(|subnet| subnet.network_id == network.id);
        subnets.sort_by(|a, b| a.id.cmp(&b.id));
        subnets.dedup_by(|a, b| a.id == b.id);
        Self {
            network,
            subnets,
            fetched_at: Utc::now(),
        }
    }

    /// Subnets carrying the eligibility tag
    pub fn tagged(&self, tag_key: &str) -> Vec<&Subnet> {
        self.subnets.iter().filter(|subnet| subnet.has_tag(tag_key)).collect()
    }

    pub fn get(&self, subnet_id: &str) -> Option<&Subnet> {
        self.subnets.iter().find(|subnet| subnet.id == subnet_id)
    }
}

/// Fetches subnet metadata on every call. Nothing is cached between calls
/// since operators retag subnets while the node is running.
#[derive(Clone)]
pub struct SubnetCatalog {
    cloud: Arc<dyn CloudControlPlane>,
    retry: RetryPolicy,
}

impl SubnetCatalog {
    pub fn new(cloud: Arc<dyn CloudControlPlane>, retry: RetryPolicy) -> Self {
        Self { cloud, retry }
    }

    /// Read the network block and all of its subnets
    pub async fn snapshot(&self, network_id: &str) -> Result<CatalogSnapshot> {
        let unavailable = |source| EngineError::CatalogUnavailable {
            network_id: network_id.to_string(),
            source,
        };

        let network = retry_cloud(&self.retry, "DescribeNetwork", || {
            self.cloud.describe_network(network_id)
        })
        .await
        .map_err(unavailable)?;

        let subnets = retry_cloud(&self.retry, "DescribeSubnets", || {
            self.cloud.describe_subnets(network_id)
        })
        .await
        .map_err(unavailable)?;

        let snapshot = CatalogSnapshot::new(network, subnets);
        debug!(
            network_id,
            subnets = snapshot.subnets.len(),
            "fetched subnet catalog"
        );
        Ok(snapshot)
    }

    /// All subnets of the network, ordered by id
    pub async fn list_subnets(&self, network_id: &str) -> Result<Vec<Subnet>> {
        Ok(self.snapshot(network_id).await?.subnets)
    }

    /// Subnets of the network carrying `tag_key`, ordered by id
    pub async fn list_eligible_subnets(&self, network_id: &str, tag_key: &str) -> Result<Vec<Subnet>> {
        let snapshot = self.snapshot(network_id).await?;
        Ok(snapshot.tagged(tag_key).into_iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{codes, CloudError};
    use crate::memory::{MemoryCloud, Operation};
    use eni_api::CNI_ELIGIBLE_TAG;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            call_timeout_ms: 1_000,
            jitter: false,
        }
    }

    fn setup() -> Arc<MemoryCloud> {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.add_network(Network::new("vpc-1", "10.0.0.0/16".parse().unwrap()));
        cloud.add_network(Network::new("vpc-2", "172.16.0.0/16".parse().unwrap()));
        cloud.add_subnet(Subnet::new("subnet-b", "vpc-1", "10.0.64.0/18".parse().unwrap()));
        cloud.add_subnet(
            Subnet::new("subnet-a", "vpc-1", "10.0.0.0/18".parse().unwrap())
                .with_tag(CNI_ELIGIBLE_TAG, "1"),
        );
        cloud.add_subnet(Subnet::new("subnet-z", "vpc-2", "172.16.0.0/24".parse().unwrap()));
        cloud
    }

    #[tokio::test]
    async fn test_snapshot_is_scoped_and_ordered() {
        let catalog = SubnetCatalog::new(setup(), fast_retry());
        let snapshot = catalog.snapshot("vpc-1").await.unwrap();

        let ids: Vec<_> = snapshot.subnets.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["subnet-a", "subnet-b"]);
        assert_eq!(snapshot.network.cidr.prefix(), 16);
    }

    #[tokio::test]
    async fn test_eligible_subnets_follow_tags() {
        let cloud = setup();
        let catalog = SubnetCatalog::new(cloud.clone(), fast_retry());

        let eligible = catalog.list_eligible_subnets("vpc-1", CNI_ELIGIBLE_TAG).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, "subnet-a");

        cloud.untag_subnet("subnet-a", CNI_ELIGIBLE_TAG);
        cloud.tag_subnet("subnet-b", CNI_ELIGIBLE_TAG, "1");
        let eligible = catalog.list_eligible_subnets("vpc-1", CNI_ELIGIBLE_TAG).await.unwrap();
        assert_eq!(eligible[0].id, "subnet-b");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let cloud = setup();
        cloud.inject_fault(Operation::DescribeSubnets, CloudError::throttled(), 2);
        let catalog = SubnetCatalog::new(cloud.clone(), fast_retry());

        assert_eq!(catalog.list_subnets("vpc-1").await.unwrap().len(), 2);
        assert_eq!(cloud.call_count(Operation::DescribeSubnets), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_catalog_unavailable() {
        let cloud = setup();
        cloud.inject_fault(Operation::DescribeSubnets, CloudError::throttled(), 3);
        let catalog = SubnetCatalog::new(cloud, fast_retry());

        match catalog.snapshot("vpc-1").await {
            Err(EngineError::CatalogUnavailable { network_id, source }) => {
                assert_eq!(network_id, "vpc-1");
                assert_eq!(source.code, codes::REQUEST_LIMIT_EXCEEDED);
            }
            other => panic!("expected CatalogUnavailable, got {:?}", other),
        }
    }
}
