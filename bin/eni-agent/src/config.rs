//! Agent configuration
//!
//! Read from the YAML file named by `ENI_AGENT_CONFIG` when set, otherwise
//! defaults; `ENI_*` variables are applied on top.

use anyhow::{Context, Result};
use eni_api::{Network, Subnet, CNI_ELIGIBLE_TAG};
use eni_core::{CloudError, EngineConfig, MemoryCloud};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

pub const CONFIG_PATH_ENV: &str = "ENI_AGENT_CONFIG";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub engine: EngineConfig,
    pub simulation: SimulationConfig,
    pub introspection: IntrospectionConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IntrospectionConfig {
    pub port: u16,
}

impl Default for IntrospectionConfig {
    fn default() -> Self {
        Self { port: 9464 }
    }
}

/// Network layout served by the simulated control plane
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulationConfig {
    pub network_id: String,
    pub network_cidr: Ipv4Network,
    pub primary_subnet_id: String,
    /// Instance id used when neither config nor the node supplies one
    pub instance_id: String,
    pub subnets: Vec<SimulatedSubnet>,
    /// Demand used when no Kubernetes node is configured
    pub demand: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedSubnet {
    pub id: String,
    pub cidr: Ipv4Network,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Address block from literal parts; prefixes above 32 fall back to a host route
fn block(octets: [u8; 4], prefix: u8) -> Ipv4Network {
    let addr = Ipv4Addr::from(octets);
    Ipv4Network::new(addr, prefix).unwrap_or_else(|_| Ipv4Network::from(addr))
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let subnet = |id: &str, cidr: Ipv4Network, tagged: bool| SimulatedSubnet {
            id: id.to_string(),
            cidr,
            tags: if tagged {
                BTreeMap::from([(CNI_ELIGIBLE_TAG.to_string(), "1".to_string())])
            } else {
                BTreeMap::new()
            },
        };
        Self {
            network_id: "vpc-sim".to_string(),
            network_cidr: block([10, 0, 0, 0], 16),
            primary_subnet_id: "subnet-sim-nodes".to_string(),
            instance_id: "i-0sim0000000000001".to_string(),
            subnets: vec![
                subnet("subnet-sim-nodes", block([10, 0, 0, 0], 20), false),
                subnet("subnet-sim-pods-a", block([10, 0, 64, 0], 18), true),
                subnet("subnet-sim-pods-b", block([10, 0, 128, 0], 18), true),
            ],
            demand: 0,
        }
    }
}

impl SimulationConfig {
    /// Build a simulated control plane holding this layout and `engine`'s
    /// instance
    pub fn build_cloud(&self, engine: &EngineConfig) -> Result<MemoryCloud, CloudError> {
        let cloud = MemoryCloud::new();
        cloud.add_network(Network::new(&self.network_id, self.network_cidr));
        for simulated in &self.subnets {
            let mut subnet = Subnet::new(&simulated.id, &self.network_id, simulated.cidr);
            subnet.tags = simulated.tags.clone();
            cloud.add_subnet(subnet);
        }
        cloud.add_instance(
            &engine.instance_id,
            &self.primary_subnet_id,
            engine.max_interfaces,
            engine.addresses_per_interface,
        )?;
        Ok(cloud)
    }
}

impl AgentConfig {
    /// Load from `ENI_AGENT_CONFIG` if set, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.engine.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eni_core::{CloudControlPlane, TieBreak};

    #[test]
    fn test_yaml_overrides_defaults() {
        let config = AgentConfig::from_yaml(
            r#"
engine:
  instanceId: i-0abc
  minPrefixLen: 18
  tieBreak: round-robin
  idleCooldownSecs: 60
simulation:
  networkCidr: 172.16.0.0/16
  primarySubnetId: subnet-1
  subnets:
    - id: subnet-1
      cidr: 172.16.0.0/20
    - id: subnet-2
      cidr: 172.16.64.0/18
      tags:
        kubernetes.io/role/cni: "1"
introspection:
  port: 8081
"#,
        )
        .unwrap();

        assert_eq!(config.engine.instance_id, "i-0abc");
        assert_eq!(config.engine.min_prefix_len, Some(18));
        assert_eq!(config.engine.tie_break, TieBreak::RoundRobin);
        assert_eq!(config.engine.max_interfaces, EngineConfig::default().max_interfaces);
        assert_eq!(config.simulation.network_id, "vpc-sim");
        assert_eq!(config.simulation.subnets.len(), 2);
        assert_eq!(config.introspection.port, 8081);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = AgentConfig::from_yaml("{}").unwrap();
        assert_eq!(config.introspection.port, 9464);
        assert_eq!(config.simulation.network_cidr.to_string(), "10.0.0.0/16");
        assert_eq!(config.simulation.subnets.len(), 3);
    }

    #[tokio::test]
    async fn test_default_simulation_builds_instance() {
        let sim = SimulationConfig::default();
        let engine = EngineConfig {
            instance_id: sim.instance_id.clone(),
            ..EngineConfig::default()
        };
        let cloud = sim.build_cloud(&engine).unwrap();

        let instance = cloud.describe_instance(&engine.instance_id).await.unwrap();
        assert_eq!(instance.network_id, "vpc-sim");
        let primary = instance.primary_interface().unwrap();
        assert_eq!(primary.subnet_id, "subnet-sim-nodes");

        let tagged: Vec<_> = cloud
            .describe_subnets("vpc-sim")
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.has_tag(CNI_ELIGIBLE_TAG))
            .collect();
        assert_eq!(tagged.len(), 2);
    }
}
