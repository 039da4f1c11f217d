//! Address demand from pods scheduled on this node

use async_trait::async_trait;
use eni_core::{DemandSource, EngineError};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use tracing::debug;

/// Counts pods on the node that need an address from the pool
pub struct PodDemandSource {
    client: Client,
    node_name: String,
}

impl PodDemandSource {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }

    async fn count_pods(&self) -> crate::Result<usize> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));
        let list = pods.list(&params).await?;
        Ok(list.items.iter().filter(|pod| pod_needs_address(pod)).count())
    }
}

#[async_trait]
impl DemandSource for PodDemandSource {
    async fn current_demand(&self) -> eni_core::Result<usize> {
        let demand = self
            .count_pods()
            .await
            .map_err(|e| EngineError::DemandUnavailable(e.to_string()))?;
        debug!(node = %self.node_name, demand, "observed pod demand");
        Ok(demand)
    }
}

/// Host-network pods use the node's address; finished pods hold none
pub fn pod_needs_address(pod: &Pod) -> bool {
    let host_network = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false);
    let finished = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .is_some_and(|phase| matches!(phase, "Succeeded" | "Failed"));
    !host_network && !finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_running_pod_needs_address() {
        let p = pod(json!({
            "metadata": {"name": "web"},
            "spec": {"containers": [{"name": "app"}]},
            "status": {"phase": "Running"}
        }));
        assert!(pod_needs_address(&p));
    }

    #[test]
    fn test_pending_pod_without_status_needs_address() {
        let p = pod(json!({
            "metadata": {"name": "web"},
            "spec": {"containers": [{"name": "app"}]}
        }));
        assert!(pod_needs_address(&p));
    }

    #[test]
    fn test_host_network_pod_is_skipped() {
        let p = pod(json!({
            "metadata": {"name": "kube-proxy"},
            "spec": {"hostNetwork": true, "containers": [{"name": "proxy"}]},
            "status": {"phase": "Running"}
        }));
        assert!(!pod_needs_address(&p));
    }

    #[test]
    fn test_finished_pods_are_skipped() {
        for phase in ["Succeeded", "Failed"] {
            let p = pod(json!({
                "metadata": {"name": "job"},
                "spec": {"containers": [{"name": "task"}]},
                "status": {"phase": phase}
            }));
            assert!(!pod_needs_address(&p), "{} pod counted", phase);
        }
    }
}
