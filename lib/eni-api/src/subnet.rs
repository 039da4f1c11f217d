//! Subnet and network descriptions

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag key marking a subnet as eligible for secondary interfaces
pub const CNI_ELIGIBLE_TAG: &str = "kubernetes.io/role/cni";

/// A subnet as reported by the cloud control plane
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    /// Subnet identifier (e.g. "subnet-0a1b2c")
    pub id: String,

    /// Owning network (VPC) identifier
    pub network_id: String,

    /// CIDR block of the subnet
    pub cidr: Ipv4Network,

    /// Tags attached to the subnet
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Free addresses remaining in the subnet
    #[serde(default)]
    pub available_addresses: u32,
}

impl Subnet {
    pub fn new(id: impl Into<String>, network_id: impl Into<String>, cidr: Ipv4Network) -> Self {
        Self {
            id: id.into(),
            network_id: network_id.into(),
            cidr,
            tags: BTreeMap::new(),
            available_addresses: 0,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_available_addresses(mut self, available: u32) -> Self {
        self.available_addresses = available;
        self
    }

    pub fn prefix_len(&self) -> u8 {
        self.cidr.prefix()
    }

    /// Whether the subnet carries `key`. A value of "0" or "false" opts the
    /// subnet out even though the key is present.
    pub fn has_tag(&self, key: &str) -> bool {
        match self.tags.get(key) {
            Some(value) => !matches!(value.trim(), "0" | "false"),
            None => false,
        }
    }

    /// Whether the whole subnet block lies inside `block`
    pub fn is_within(&self, block: &Ipv4Network) -> bool {
        self.cidr.prefix() >= block.prefix()
            && block.contains(self.cidr.network())
            && block.contains(self.cidr.broadcast())
    }
}

/// A network (VPC) and its declared address block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub id: String,
    pub cidr: Ipv4Network,
}

impl Network {
    pub fn new(id: impl Into<String>, cidr: Ipv4Network) -> Self {
        Self { id: id.into(), cidr }
    }

    /// A subnet is routable without extra configuration when it belongs to
    /// this network and sits entirely inside its block.
    pub fn contains_subnet(&self, subnet: &Subnet) -> bool {
        subnet.network_id == self.id && subnet.is_within(&self.cidr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_tag_presence() {
        let subnet = Subnet::new("subnet-a", "vpc-1", net("10.0.0.0/18"))
            .with_tag(CNI_ELIGIBLE_TAG, "1");
        assert!(subnet.has_tag(CNI_ELIGIBLE_TAG));
        assert!(!subnet.has_tag("other"));
    }

    #[test]
    fn test_tag_opt_out_value() {
        let subnet = Subnet::new("subnet-a", "vpc-1", net("10.0.0.0/18"))
            .with_tag(CNI_ELIGIBLE_TAG, "0");
        assert!(!subnet.has_tag(CNI_ELIGIBLE_TAG));
    }

    #[test]
    fn test_subnet_within_block() {
        let block = net("10.0.0.0/16");
        assert!(Subnet::new("a", "vpc-1", net("10.0.64.0/18")).is_within(&block));
        assert!(Subnet::new("b", "vpc-1", net("10.0.0.0/16")).is_within(&block));
        assert!(!Subnet::new("c", "vpc-1", net("10.0.0.0/15")).is_within(&block));
        assert!(!Subnet::new("d", "vpc-1", net("10.1.0.0/24")).is_within(&block));
    }

    #[test]
    fn test_network_requires_matching_id() {
        let network = Network::new("vpc-1", net("10.0.0.0/16"));
        assert!(network.contains_subnet(&Subnet::new("a", "vpc-1", net("10.0.1.0/24"))));
        assert!(!network.contains_subnet(&Subnet::new("a", "vpc-2", net("10.0.1.0/24"))));
    }

    #[test]
    fn test_subnet_serializes_camel_case() {
        let subnet = Subnet::new("subnet-a", "vpc-1", net("10.0.0.0/18"));
        let json = serde_json::to_value(&subnet).unwrap();
        assert_eq!(json["networkId"], "vpc-1");
        assert_eq!(json["cidr"], "10.0.0.0/18");
    }
}
