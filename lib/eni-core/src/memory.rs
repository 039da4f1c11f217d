//! In-process control plane used by the agent's simulation mode and by tests
//!
//! `MemoryCloud` keeps networks, subnets, instances and interfaces in memory,
//! hands out addresses from subnet blocks, enforces the per-instance
//! interface limit and lets callers script failures per operation.

use crate::cloud::{
    codes, Attachment, CloudControlPlane, CloudError, CloudResult, InstanceDescription,
    InterfaceDescription,
};
use async_trait::async_trait;
use eni_api::{Network, Subnet};
use ipnetwork::Ipv4Network;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Addresses at the start of a subnet block reserved by the provider
const RESERVED_LEADING: u32 = 4;

/// Control-plane operations, used to script faults and count calls
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateInterface,
    AttachInterface,
    DetachInterface,
    DeleteInterface,
    DescribeInterface,
    DescribeInstance,
    DescribeSubnet,
    DescribeSubnets,
    DescribeNetwork,
}

struct InstanceRecord {
    network_id: String,
    primary_address: Ipv4Addr,
    max_interfaces: usize,
}

struct InterfaceRecord {
    subnet_id: String,
    primary_address: Ipv4Addr,
    secondary_addresses: Vec<Ipv4Addr>,
    attachment: Option<Attachment>,
    /// Describe calls that still answer "not found" after attach
    invisible_reads: u32,
}

#[derive(Default)]
struct CloudState {
    networks: BTreeMap<String, Network>,
    subnets: BTreeMap<String, Subnet>,
    instances: BTreeMap<String, InstanceRecord>,
    interfaces: BTreeMap<String, InterfaceRecord>,
    allocated: HashMap<String, BTreeSet<Ipv4Addr>>,
    faults: HashMap<Operation, VecDeque<CloudError>>,
    calls: HashMap<Operation, usize>,
    visibility_lag: u32,
    /// Client token of each create request mapped to the interface it made
    client_tokens: HashMap<String, String>,
    /// Extra latency for upcoming create responses, applied after the
    /// interface already exists
    create_delays: VecDeque<Duration>,
}

impl CloudState {
    fn enter(&mut self, op: Operation) -> CloudResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.faults.get_mut(&op).and_then(|queue| queue.pop_front()) {
            Some(err) => {
                debug!(?op, error = %err, "injected control-plane fault");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn subnet_capacity(cidr: &Ipv4Network) -> u32 {
        // network address, three provider addresses and broadcast
        cidr.size().saturating_sub(RESERVED_LEADING + 1)
    }

    fn available_in(&self, subnet: &Subnet) -> u32 {
        let used = self.allocated.get(&subnet.id).map_or(0, |set| set.len() as u32);
        Self::subnet_capacity(&subnet.cidr).saturating_sub(used)
    }

    fn allocate(&mut self, subnet_id: &str, count: u32) -> CloudResult<Vec<Ipv4Addr>> {
        let subnet = self
            .subnets
            .get(subnet_id)
            .ok_or_else(|| subnet_not_found(subnet_id))?;
        if self.available_in(subnet) < count {
            return Err(CloudError::new(
                codes::INSUFFICIENT_ADDRESSES,
                format!("Subnet '{}' has insufficient free addresses", subnet_id),
            ));
        }

        let cidr = subnet.cidr;
        let first = u32::from(cidr.network()) + RESERVED_LEADING;
        let last = u32::from(cidr.broadcast());
        let used = self.allocated.entry(subnet_id.to_string()).or_default();

        let mut picked = Vec::with_capacity(count as usize);
        for raw in first..last {
            if picked.len() == count as usize {
                break;
            }
            let addr = Ipv4Addr::from(raw);
            if used.insert(addr) {
                picked.push(addr);
            }
        }
        Ok(picked)
    }

    fn free(&mut self, subnet_id: &str, addresses: impl IntoIterator<Item = Ipv4Addr>) {
        if let Some(used) = self.allocated.get_mut(subnet_id) {
            for addr in addresses {
                used.remove(&addr);
            }
        }
    }

    fn describe(&self, id: &str, record: &InterfaceRecord) -> InterfaceDescription {
        InterfaceDescription {
            id: id.to_string(),
            subnet_id: record.subnet_id.clone(),
            primary_address: record.primary_address,
            secondary_addresses: record.secondary_addresses.clone(),
            attachment: record.attachment.clone(),
        }
    }

    fn attached_to(&self, instance_id: &str) -> Vec<(&String, &InterfaceRecord)> {
        let mut attached: Vec<_> = self
            .interfaces
            .iter()
            .filter(|(_, rec)| {
                rec.attachment
                    .as_ref()
                    .is_some_and(|att| att.instance_id == instance_id)
            })
            .collect();
        attached.sort_by_key(|(_, rec)| rec.attachment.as_ref().map(|att| att.device_index));
        attached
    }
}

fn subnet_not_found(subnet_id: &str) -> CloudError {
    CloudError::new(
        codes::SUBNET_NOT_FOUND,
        format!("The subnet ID '{}' does not exist", subnet_id),
    )
}

fn new_interface_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("eni-{}", &hex[..17])
}

/// Simulated cloud network control plane
#[derive(Default)]
pub struct MemoryCloud {
    state: Mutex<CloudState>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_network(&self, network: Network) {
        self.state().networks.insert(network.id.clone(), network);
    }

    pub fn add_subnet(&self, subnet: Subnet) {
        self.state().subnets.insert(subnet.id.clone(), subnet);
    }

    /// Set a tag the way an operator would from the console
    pub fn tag_subnet(&self, subnet_id: &str, key: &str, value: &str) {
        if let Some(subnet) = self.state().subnets.get_mut(subnet_id) {
            subnet.tags.insert(key.to_string(), value.to_string());
        }
    }

    pub fn untag_subnet(&self, subnet_id: &str, key: &str) {
        if let Some(subnet) = self.state().subnets.get_mut(subnet_id) {
            subnet.tags.remove(key);
        }
    }

    /// Register an instance booted with a primary interface in
    /// `primary_subnet_id`. Returns the primary interface id.
    pub fn add_instance(
        &self,
        instance_id: &str,
        primary_subnet_id: &str,
        max_interfaces: usize,
        addresses_per_interface: u32,
    ) -> CloudResult<String> {
        let mut state = self.state();
        let network_id = state
            .subnets
            .get(primary_subnet_id)
            .map(|subnet| subnet.network_id.clone())
            .ok_or_else(|| subnet_not_found(primary_subnet_id))?;

        let mut addresses = state.allocate(primary_subnet_id, addresses_per_interface + 1)?;
        let primary_address = addresses.remove(0);
        let interface_id = new_interface_id();

        state.interfaces.insert(
            interface_id.clone(),
            InterfaceRecord {
                subnet_id: primary_subnet_id.to_string(),
                primary_address,
                secondary_addresses: addresses,
                attachment: Some(Attachment {
                    instance_id: instance_id.to_string(),
                    device_index: 0,
                }),
                invisible_reads: 0,
            },
        );
        state.instances.insert(
            instance_id.to_string(),
            InstanceRecord {
                network_id,
                primary_address,
                max_interfaces,
            },
        );
        Ok(interface_id)
    }

    /// Fail the next `count` calls of `op` with `error`
    pub fn inject_fault(&self, op: Operation, error: CloudError, count: usize) {
        let mut state = self.state();
        let queue = state.faults.entry(op).or_default();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    /// Number of describe-interface calls that miss a freshly attached
    /// interface before it becomes visible
    pub fn set_visibility_lag(&self, reads: u32) {
        self.state().visibility_lag = reads;
    }

    /// Answer the next `count` create calls only after `delay`. The interface
    /// is created before the wait, like a request whose response is lost.
    pub fn delay_create_responses(&self, delay: Duration, count: usize) {
        let mut state = self.state();
        for _ in 0..count {
            state.create_delays.push_back(delay);
        }
    }

    pub fn call_count(&self, op: Operation) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Ids of every interface that still exists, attached or not
    pub fn interface_ids(&self) -> Vec<String> {
        self.state().interfaces.keys().cloned().collect()
    }

    /// Secondary interfaces currently attached to `instance_id`, with their subnet
    pub fn secondary_interfaces(&self, instance_id: &str) -> Vec<(String, String)> {
        let state = self.state();
        state
            .attached_to(instance_id)
            .into_iter()
            .filter(|(_, rec)| rec.attachment.as_ref().is_some_and(|att| att.device_index > 0))
            .map(|(id, rec)| (id.clone(), rec.subnet_id.clone()))
            .collect()
    }
}

#[async_trait]
impl CloudControlPlane for MemoryCloud {
    async fn create_interface(
        &self,
        subnet_id: &str,
        address_count: u32,
        client_token: &str,
    ) -> CloudResult<String> {
        let (interface_id, delay) = {
            let mut state = self.state();
            state.enter(Operation::CreateInterface)?;
            let delay = state.create_delays.pop_front();

            let existing = state
                .client_tokens
                .get(client_token)
                .filter(|id| state.interfaces.contains_key(id.as_str()))
                .cloned();
            let interface_id = match existing {
                Some(interface_id) => {
                    debug!(interface_id = %interface_id, client_token, "repeated create request");
                    interface_id
                }
                None => {
                    let mut addresses = state.allocate(subnet_id, address_count + 1)?;
                    let primary_address = addresses.remove(0);
                    let interface_id = new_interface_id();
                    state.interfaces.insert(
                        interface_id.clone(),
                        InterfaceRecord {
                            subnet_id: subnet_id.to_string(),
                            primary_address,
                            secondary_addresses: addresses,
                            attachment: None,
                            invisible_reads: 0,
                        },
                    );
                    state
                        .client_tokens
                        .insert(client_token.to_string(), interface_id.clone());
                    debug!(interface_id = %interface_id, subnet_id, "created interface");
                    interface_id
                }
            };
            (interface_id, delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(interface_id)
    }

    async fn attach_interface(
        &self,
        interface_id: &str,
        instance_id: &str,
        device_index: u32,
    ) -> CloudResult<()> {
        let mut state = self.state();
        state.enter(Operation::AttachInterface)?;

        let (network_id, max_interfaces) = match state.instances.get(instance_id) {
            Some(instance) => (instance.network_id.clone(), instance.max_interfaces),
            None => {
                return Err(CloudError::new(
                    codes::INSTANCE_NOT_FOUND,
                    format!("The instance ID '{}' does not exist", instance_id),
                ))
            }
        };
        let attached = state.attached_to(instance_id);
        let slot_taken = attached.iter().any(|(id, rec)| {
            id.as_str() != interface_id
                && rec.attachment.as_ref().is_some_and(|att| att.device_index == device_index)
        });
        let already_here = attached.iter().any(|(id, _)| id.as_str() == interface_id);
        let attached_count = attached.len();

        let record = state
            .interfaces
            .get(interface_id)
            .ok_or_else(|| CloudError::interface_not_found(interface_id))?;
        if let Some(att) = &record.attachment {
            if att.instance_id == instance_id && att.device_index == device_index {
                return Ok(());
            }
            return Err(CloudError::new(
                codes::INVALID_PARAMETER,
                format!("Interface '{}' is already attached", interface_id),
            ));
        }
        let subnet_network = state.subnets.get(&record.subnet_id).map(|s| s.network_id.clone());
        if subnet_network.as_deref() != Some(network_id.as_str()) {
            return Err(CloudError::new(
                codes::INVALID_PARAMETER,
                "Interface and instance are in different networks",
            ));
        }
        if slot_taken {
            return Err(CloudError::new(
                codes::INVALID_PARAMETER,
                format!("Device index {} is in use", device_index),
            ));
        }
        if !already_here && attached_count >= max_interfaces {
            return Err(CloudError::new(
                codes::ATTACHMENT_LIMIT_EXCEEDED,
                format!("Interface limit {} reached for '{}'", max_interfaces, instance_id),
            ));
        }

        let lag = state.visibility_lag;
        if let Some(record) = state.interfaces.get_mut(interface_id) {
            record.attachment = Some(Attachment {
                instance_id: instance_id.to_string(),
                device_index,
            });
            record.invisible_reads = lag;
        }
        Ok(())
    }

    async fn detach_interface(&self, interface_id: &str) -> CloudResult<()> {
        let mut state = self.state();
        state.enter(Operation::DetachInterface)?;

        let record = state
            .interfaces
            .get_mut(interface_id)
            .ok_or_else(|| CloudError::interface_not_found(interface_id))?;
        match record.attachment.take() {
            Some(att) if att.device_index == 0 => {
                record.attachment = Some(att);
                Err(CloudError::new(
                    codes::INVALID_PARAMETER,
                    "The primary interface cannot be detached",
                ))
            }
            Some(_) => Ok(()),
            None => Err(CloudError::new(
                codes::ATTACHMENT_NOT_FOUND,
                format!("Interface '{}' is not attached", interface_id),
            )),
        }
    }

    async fn delete_interface(&self, interface_id: &str) -> CloudResult<()> {
        let mut state = self.state();
        state.enter(Operation::DeleteInterface)?;

        let attached = state
            .interfaces
            .get(interface_id)
            .ok_or_else(|| CloudError::interface_not_found(interface_id))?
            .attachment
            .is_some();
        if attached {
            return Err(CloudError::new(
                codes::INTERFACE_IN_USE,
                format!("Interface '{}' is currently in use", interface_id),
            ));
        }

        if let Some(record) = state.interfaces.remove(interface_id) {
            let mut addresses = record.secondary_addresses;
            addresses.push(record.primary_address);
            state.free(&record.subnet_id, addresses);
        }
        Ok(())
    }

    async fn describe_interface(&self, interface_id: &str) -> CloudResult<InterfaceDescription> {
        let mut state = self.state();
        state.enter(Operation::DescribeInterface)?;

        let record = state
            .interfaces
            .get_mut(interface_id)
            .ok_or_else(|| CloudError::interface_not_found(interface_id))?;
        if record.invisible_reads > 0 {
            record.invisible_reads -= 1;
            return Err(CloudError::not_yet_visible(interface_id));
        }
        let record = &state.interfaces[interface_id];
        Ok(state.describe(interface_id, record))
    }

    async fn describe_instance(&self, instance_id: &str) -> CloudResult<InstanceDescription> {
        let mut state = self.state();
        state.enter(Operation::DescribeInstance)?;

        let instance = state.instances.get(instance_id).ok_or_else(|| {
            CloudError::new(
                codes::INSTANCE_NOT_FOUND,
                format!("The instance ID '{}' does not exist", instance_id),
            )
        })?;
        let interfaces = state
            .attached_to(instance_id)
            .into_iter()
            .map(|(id, rec)| state.describe(id, rec))
            .collect();

        Ok(InstanceDescription {
            id: instance_id.to_string(),
            network_id: instance.network_id.clone(),
            primary_address: instance.primary_address,
            interfaces,
        })
    }

    async fn describe_subnet(&self, subnet_id: &str) -> CloudResult<Subnet> {
        let mut state = self.state();
        state.enter(Operation::DescribeSubnet)?;

        let subnet = state
            .subnets
            .get(subnet_id)
            .ok_or_else(|| subnet_not_found(subnet_id))?;
        let available = state.available_in(subnet);
        Ok(subnet.clone().with_available_addresses(available))
    }

    async fn describe_subnets(&self, network_id: &str) -> CloudResult<Vec<Subnet>> {
        let mut state = self.state();
        state.enter(Operation::DescribeSubnets)?;

        Ok(state
            .subnets
            .values()
            .filter(|subnet| subnet.network_id == network_id)
            .map(|subnet| subnet.clone().with_available_addresses(state.available_in(subnet)))
            .collect())
    }

    async fn describe_network(&self, network_id: &str) -> CloudResult<Network> {
        let mut state = self.state();
        state.enter(Operation::DescribeNetwork)?;

        state.networks.get(network_id).cloned().ok_or_else(|| {
            CloudError::new(
                codes::NETWORK_NOT_FOUND,
                format!("The vpc ID '{}' does not exist", network_id),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud() -> MemoryCloud {
        let cloud = MemoryCloud::new();
        cloud.add_network(Network::new("vpc-1", "10.0.0.0/16".parse().unwrap()));
        cloud.add_subnet(Subnet::new("subnet-a", "vpc-1", "10.0.0.0/24".parse().unwrap()));
        cloud
    }

    #[tokio::test]
    async fn test_allocation_skips_reserved_addresses() {
        let cloud = cloud();
        let id = cloud.create_interface("subnet-a", 2, "token-1").await.unwrap();
        cloud.set_visibility_lag(0);
        let desc = cloud.describe_interface(&id).await.unwrap();
        assert_eq!(desc.primary_address, Ipv4Addr::new(10, 0, 0, 4));
        assert_eq!(
            desc.secondary_addresses,
            vec![Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 6)]
        );

        let subnet = cloud.describe_subnet("subnet-a").await.unwrap();
        assert_eq!(subnet.available_addresses, 256 - 5 - 3);
    }

    #[tokio::test]
    async fn test_interface_limit_enforced() {
        let cloud = cloud();
        cloud.add_instance("i-1", "subnet-a", 2, 1).unwrap();

        let first = cloud.create_interface("subnet-a", 1, "token-2").await.unwrap();
        cloud.attach_interface(&first, "i-1", 1).await.unwrap();

        let second = cloud.create_interface("subnet-a", 1, "token-3").await.unwrap();
        let err = cloud.attach_interface(&second, "i-1", 2).await.unwrap_err();
        assert_eq!(err.code, codes::ATTACHMENT_LIMIT_EXCEEDED);
    }

    #[tokio::test]
    async fn test_delete_requires_detach() {
        let cloud = cloud();
        cloud.add_instance("i-1", "subnet-a", 3, 1).unwrap();
        let id = cloud.create_interface("subnet-a", 1, "token-4").await.unwrap();
        cloud.attach_interface(&id, "i-1", 1).await.unwrap();

        let err = cloud.delete_interface(&id).await.unwrap_err();
        assert_eq!(err.code, codes::INTERFACE_IN_USE);

        cloud.detach_interface(&id).await.unwrap();
        cloud.delete_interface(&id).await.unwrap();
        assert!(!cloud.interface_ids().contains(&id));
    }

    #[tokio::test]
    async fn test_visibility_lag_then_visible() {
        let cloud = cloud();
        cloud.add_instance("i-1", "subnet-a", 3, 1).unwrap();
        cloud.set_visibility_lag(2);
        let id = cloud.create_interface("subnet-a", 1, "token-5").await.unwrap();
        cloud.attach_interface(&id, "i-1", 1).await.unwrap();

        assert!(cloud.describe_interface(&id).await.unwrap_err().is_retryable());
        assert!(cloud.describe_interface(&id).await.is_err());
        assert!(cloud.describe_interface(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let cloud = cloud();
        cloud.inject_fault(Operation::DescribeSubnets, CloudError::throttled(), 1);
        assert!(cloud.describe_subnets("vpc-1").await.is_err());
        assert_eq!(cloud.describe_subnets("vpc-1").await.unwrap().len(), 1);
        assert_eq!(cloud.call_count(Operation::DescribeSubnets), 2);
    }

    #[tokio::test]
    async fn test_describe_instance_orders_by_device_index() {
        let cloud = cloud();
        let primary = cloud.add_instance("i-1", "subnet-a", 3, 1).unwrap();
        let id = cloud.create_interface("subnet-a", 1, "token-6").await.unwrap();
        cloud.attach_interface(&id, "i-1", 1).await.unwrap();

        let instance = cloud.describe_instance("i-1").await.unwrap();
        assert_eq!(instance.network_id, "vpc-1");
        assert_eq!(instance.primary_interface().map(|i| i.id.clone()), Some(primary));
        assert_eq!(instance.interfaces[1].id, id);
    }

    #[tokio::test]
    async fn test_repeated_client_token_returns_same_interface() {
        let cloud = cloud();
        let first = cloud.create_interface("subnet-a", 2, "ticket-1").await.unwrap();
        let again = cloud.create_interface("subnet-a", 2, "ticket-1").await.unwrap();
        let other = cloud.create_interface("subnet-a", 2, "ticket-2").await.unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(cloud.interface_ids().len(), 2);
        let subnet = cloud.describe_subnet("subnet-a").await.unwrap();
        assert_eq!(subnet.available_addresses, 256 - 5 - 6);
    }

    #[tokio::test]
    async fn test_delayed_create_exists_before_response() {
        let cloud = std::sync::Arc::new(cloud());
        cloud.delay_create_responses(Duration::from_millis(200), 1);

        let pending = {
            let cloud = cloud.clone();
            tokio::spawn(async move { cloud.create_interface("subnet-a", 1, "slow").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cloud.interface_ids().len(), 1);

        let id = pending.await.unwrap().unwrap();
        assert_eq!(cloud.interface_ids(), vec![id]);
    }
}
