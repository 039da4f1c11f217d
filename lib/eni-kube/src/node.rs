//! Node identity lookup

use crate::error::{KubeError, Result};
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use tracing::debug;

/// Resolve the cloud instance id backing `node_name` from its providerID
pub async fn node_instance_id(client: Client, node_name: &str) -> Result<String> {
    let nodes: Api<Node> = Api::all(client);
    let node = nodes.get(node_name).await?;
    let provider_id = node
        .spec
        .and_then(|spec| spec.provider_id)
        .ok_or_else(|| KubeError::MissingProviderId(node_name.to_string()))?;

    let instance_id = parse_provider_id(&provider_id)?;
    debug!(node = node_name, %provider_id, %instance_id, "resolved node instance id");
    Ok(instance_id)
}

/// Extract the instance id from a providerID such as
/// `aws:///us-west-2a/i-0abc123`
pub fn parse_provider_id(provider_id: &str) -> Result<String> {
    let (_, path) = provider_id
        .split_once("://")
        .ok_or_else(|| KubeError::InvalidProviderId(provider_id.to_string()))?;
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
        .ok_or_else(|| KubeError::InvalidProviderId(provider_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provider_id() {
        assert_eq!(
            parse_provider_id("aws:///us-west-2a/i-0abc123").unwrap(),
            "i-0abc123"
        );
        assert_eq!(parse_provider_id("aws:///i-0abc123/").unwrap(), "i-0abc123");
    }

    #[test]
    fn test_parse_provider_id_rejects_garbage() {
        assert!(matches!(
            parse_provider_id("i-0abc123"),
            Err(KubeError::InvalidProviderId(_))
        ));
        assert!(parse_provider_id("aws:///").is_err());
    }
}
