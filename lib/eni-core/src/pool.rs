//! Interface pool manager
//!
//! Owns the node's interfaces and drives them through
//! `Requested → Creating → Attached → DetachRequested → Detaching → Deleted`.
//! All pool mutations go through one lock. Control-plane calls are made
//! with the lock released; only the resulting transition is applied under it.

use crate::catalog::SubnetCatalog;
use crate::cloud::{codes, CloudControlPlane, CloudError, CloudResult, InterfaceDescription};
use crate::config::EngineConfig;
use crate::metrics::EngineMetrics;
use crate::retry::retry_cloud;
use crate::selector::SubnetSelector;
use crate::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use eni_api::{InterfaceState, NetworkInterface, PoolStatus};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A provision that has reserved a device slot but has no interface id yet
#[derive(Debug)]
struct PendingProvision {
    state: InterfaceState,
    device_index: u32,
    subnet_id: Option<String>,
}

#[derive(Debug)]
struct ErrorBackoff {
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct PoolState {
    network_id: Option<String>,
    pub(crate) interfaces: BTreeMap<String, NetworkInterface>,
    pending: HashMap<Uuid, PendingProvision>,
    error_backoff: HashMap<String, ErrorBackoff>,
    /// Demand seen by the last reconciliation pass
    observed_demand: usize,
}

impl PoolState {
    /// Interface slots taken on the instance, including in-flight provisions
    fn in_use(&self) -> usize {
        self.interfaces.len() + self.pending.len()
    }

    fn next_device_index(&self) -> u32 {
        let used: BTreeSet<u32> = self
            .interfaces
            .values()
            .map(|iface| iface.device_index)
            .chain(self.pending.values().map(|p| p.device_index))
            .collect();
        let mut index = 1;
        while used.contains(&index) {
            index += 1;
        }
        index
    }

    fn capacity(&self) -> usize {
        self.interfaces.values().map(NetworkInterface::capacity).sum()
    }

    fn leased(&self) -> usize {
        self.interfaces.values().map(|iface| iface.leased.len()).sum()
    }

    fn get_mut(&mut self, interface_id: &str) -> Result<&mut NetworkInterface> {
        self.interfaces
            .get_mut(interface_id)
            .ok_or_else(|| EngineError::InterfaceNotFound(interface_id.to_string()))
    }

    fn remove(&mut self, interface_id: &str) {
        if let Some(iface) = self.interfaces.remove(interface_id) {
            debug!(interface_id, from = %iface.state, "interface deleted");
        }
        self.error_backoff.remove(interface_id);
    }
}

/// Validate and apply a state change
pub(crate) fn transition(iface: &mut NetworkInterface, to: InterfaceState) -> Result<()> {
    if !iface.state.can_transition_to(to) {
        return Err(EngineError::InvalidTransition {
            interface_id: iface.id.clone(),
            from: iface.state,
            to,
        });
    }
    debug!(interface_id = %iface.id, from = %iface.state, to = %to, "interface transition");
    iface.state = to;
    iface.observed_at = Utc::now();
    Ok(())
}

/// InterfacePool owns the secondary interfaces attached to this node
pub struct InterfacePool {
    cloud: Arc<dyn CloudControlPlane>,
    selector: SubnetSelector,
    config: EngineConfig,
    metrics: EngineMetrics,
    pub(crate) state: Mutex<PoolState>,
}

impl InterfacePool {
    pub fn new(
        cloud: Arc<dyn CloudControlPlane>,
        selector: SubnetSelector,
        config: EngineConfig,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            cloud,
            selector,
            config,
            metrics,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Build a pool with a selector over a fresh catalog of `cloud`
    pub fn from_config(
        cloud: Arc<dyn CloudControlPlane>,
        config: EngineConfig,
        metrics: EngineMetrics,
    ) -> Self {
        let catalog = SubnetCatalog::new(cloud.clone(), config.catalog_retry.clone());
        let selector = SubnetSelector::new(catalog, config.eligibility_tag.clone(), config.tie_break);
        Self::new(cloud, selector, config, metrics)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Adopt the instance's current interfaces. The device-index-0 interface
    /// becomes the primary and is never released.
    pub async fn bootstrap(&self) -> Result<()> {
        let instance_id = self.config.instance_id.as_str();
        let instance = retry_cloud(&self.config.cloud_retry, "DescribeInstance", || {
            self.cloud.describe_instance(instance_id)
        })
        .await?;

        let primary = instance.primary_interface().ok_or_else(|| {
            EngineError::InterfaceNotFound(format!("primary interface of {}", instance.id))
        })?;
        self.selector.set_primary_subnet(primary.subnet_id.clone());

        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.network_id = Some(instance.network_id.clone());

        for desc in &instance.interfaces {
            if state.interfaces.contains_key(&desc.id) {
                continue;
            }
            let device_index = desc.attachment.as_ref().map_or(0, |att| att.device_index);
            let mut iface = NetworkInterface::new(&desc.id, &desc.subnet_id, device_index);
            iface.primary = device_index == 0;
            iface.state = InterfaceState::Attached;
            iface.addresses = sorted(desc.secondary_addresses.clone());
            iface.idle_since = Some(now);
            state.interfaces.insert(desc.id.clone(), iface);
        }

        info!(
            instance_id,
            network_id = %instance.network_id,
            interfaces = state.interfaces.len(),
            capacity = state.capacity(),
            "interface pool bootstrapped"
        );
        self.update_gauges(&state);
        Ok(())
    }

    /// Create and attach one secondary interface in a selected subnet.
    ///
    /// Transient control-plane failures are retried with capped backoff. When
    /// retries run out the partially created interface is detached and
    /// deleted before `ProvisionFailed` is returned.
    pub async fn provision(&self) -> Result<NetworkInterface> {
        let (ticket, device_index, network_id) = self.reserve().await?;

        let selection = match self
            .selector
            .select_subnet(&network_id, self.config.min_prefix_len)
            .await
        {
            Ok(selection) => selection,
            Err(err) => {
                self.abandon(ticket).await;
                self.metrics.provision_failures_total.inc();
                return Err(err);
            }
        };
        let subnet_id = selection.subnet.id;
        self.mark_creating(ticket, &subnet_id).await?;

        // The ticket is the client token; a retried create returns the same interface
        let client_token = ticket.to_string();
        let address_count = self.config.addresses_per_interface;
        let created = retry_cloud(&self.config.cloud_retry, "CreateInterface", || {
            self.cloud
                .create_interface(&subnet_id, address_count, &client_token)
        })
        .await;
        let interface_id = match created {
            Ok(id) => id,
            Err(source) => {
                self.abandon(ticket).await;
                return Err(self.provision_failed(subnet_id, source));
            }
        };
        self.register_created(ticket, &interface_id, &subnet_id, device_index)
            .await;

        let instance_id = self.config.instance_id.as_str();
        let attached = retry_cloud(&self.config.cloud_retry, "AttachInterface", || {
            self.cloud
                .attach_interface(&interface_id, instance_id, device_index)
        })
        .await;
        if let Err(source) = attached {
            self.roll_back(&interface_id).await;
            return Err(self.provision_failed(subnet_id, source));
        }

        let visible = retry_cloud(&self.config.cloud_retry, "DescribeInterface", || {
            self.describe_attached(&interface_id)
        })
        .await;
        let description = match visible {
            Ok(description) => description,
            Err(source) => {
                self.roll_back(&interface_id).await;
                return Err(self.provision_failed(subnet_id, source));
            }
        };

        let iface = self.commit_attached(&interface_id, description).await?;
        self.metrics.provision_total.inc();
        info!(
            interface_id = %iface.id,
            subnet_id = %iface.subnet_id,
            device_index,
            addresses = iface.addresses.len(),
            "provisioned secondary interface"
        );
        Ok(iface)
    }

    /// Detach and delete an idle secondary interface.
    ///
    /// The interface must be `Attached` with no leased addresses. Leases that
    /// show up before the detach is issued abort the release and restore the
    /// interface to `Attached`.
    pub async fn release(&self, interface_id: &str) -> Result<()> {
        self.mark_for_release(interface_id, 0).await?;
        self.complete_release(interface_id).await
    }

    /// Release an idle interface only if the remaining capacity still covers
    /// the last observed demand plus the warm target
    pub async fn release_idle(&self, interface_id: &str) -> Result<()> {
        let floor = {
            let state = self.state.lock().await;
            state
                .observed_demand
                .saturating_add(self.config.warm_address_target)
        };
        self.mark_for_release(interface_id, floor).await?;
        self.complete_release(interface_id).await
    }

    /// Remember the demand the reconciler last acted on
    pub async fn record_demand(&self, demand: usize) {
        self.state.lock().await.observed_demand = demand;
    }

    pub async fn observed_demand(&self) -> usize {
        self.state.lock().await.observed_demand
    }

    async fn mark_for_release(&self, interface_id: &str, floor: usize) -> Result<()> {
        let mut state = self.state.lock().await;
        let total = state.capacity();
        let iface = state.get_mut(interface_id)?;
        if iface.primary {
            return Err(EngineError::PrimaryInterface(interface_id.to_string()));
        }
        if iface.has_leases() {
            return Err(EngineError::ReleaseConflict {
                interface_id: interface_id.to_string(),
                leased: iface.leased.len(),
            });
        }
        let remaining = total.saturating_sub(iface.capacity());
        if remaining < floor {
            return Err(EngineError::CapacityNeeded {
                interface_id: interface_id.to_string(),
                remaining,
                required: floor,
            });
        }
        transition(iface, InterfaceState::DetachRequested)
    }

    async fn complete_release(&self, interface_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let iface = state.get_mut(interface_id)?;
            if iface.has_leases() {
                let leased = iface.leased.len();
                transition(iface, InterfaceState::Attached)?;
                iface.idle_since = None;
                info!(interface_id, leased, "release aborted, addresses leased");
                return Err(EngineError::ReleaseConflict {
                    interface_id: interface_id.to_string(),
                    leased,
                });
            }
            transition(iface, InterfaceState::Detaching)?;
            self.update_gauges(&state);
        }

        if let Err(source) = self.detach(interface_id).await {
            let mut state = self.state.lock().await;
            if source.is_retryable() {
                if let Ok(iface) = state.get_mut(interface_id) {
                    let _ = transition(iface, InterfaceState::Attached);
                    iface.last_error = Some(source.to_string());
                }
            } else {
                self.mark_error(&mut state, interface_id, &source, Utc::now());
            }
            self.update_gauges(&state);
            self.metrics.release_failures_total.inc();
            return Err(EngineError::ReleaseFailed {
                interface_id: interface_id.to_string(),
                source,
            });
        }

        if let Err(source) = self.delete(interface_id).await {
            let mut state = self.state.lock().await;
            self.mark_error(&mut state, interface_id, &source, Utc::now());
            self.metrics.release_failures_total.inc();
            return Err(EngineError::ReleaseFailed {
                interface_id: interface_id.to_string(),
                source,
            });
        }

        let mut state = self.state.lock().await;
        state.remove(interface_id);
        self.update_gauges(&state);
        self.metrics.release_total.inc();
        info!(interface_id, "released secondary interface");
        Ok(())
    }

    /// Retry cleanup of interfaces stuck in `Error` whose backoff has
    /// elapsed. Returns how many were cleaned up.
    pub async fn retry_errored(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<String> = {
            let mut state = self.state.lock().await;
            let due: Vec<String> = state
                .interfaces
                .values()
                .filter(|iface| iface.state == InterfaceState::Error)
                .filter(|iface| {
                    state
                        .error_backoff
                        .get(&iface.id)
                        .map_or(true, |backoff| backoff.next_attempt_at <= now)
                })
                .map(|iface| iface.id.clone())
                .collect();
            for id in &due {
                if let Ok(iface) = state.get_mut(id) {
                    let _ = transition(iface, InterfaceState::Detaching);
                }
            }
            due
        };

        let mut recovered = 0;
        for interface_id in due {
            let result = match self.detach(&interface_id).await {
                Ok(()) => self.delete(&interface_id).await,
                Err(err) => Err(err),
            };
            let mut state = self.state.lock().await;
            match result {
                Ok(()) => {
                    state.remove(&interface_id);
                    recovered += 1;
                    info!(interface_id = %interface_id, "cleaned up errored interface");
                }
                Err(err) => {
                    self.mark_error(&mut state, &interface_id, &err, now);
                }
            }
            self.update_gauges(&state);
        }
        recovered
    }

    /// Secondary interfaces that have been idle for at least `cooldown`
    pub async fn idle_candidates(&self, now: DateTime<Utc>, cooldown: Duration) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .interfaces
            .values()
            .filter(|iface| {
                iface.state == InterfaceState::Attached && !iface.primary && !iface.has_leases()
            })
            .filter(|iface| iface.idle_since.is_some_and(|since| now - since >= cooldown))
            .map(|iface| iface.id.clone())
            .collect()
    }

    /// Leasable addresses across all attached interfaces
    pub async fn capacity(&self) -> usize {
        self.state.lock().await.capacity()
    }

    pub async fn leased_count(&self) -> usize {
        self.state.lock().await.leased()
    }

    /// Interface slots still free under the platform limit
    pub async fn available_slots(&self) -> usize {
        let state = self.state.lock().await;
        self.config.max_interfaces.saturating_sub(state.in_use())
    }

    pub async fn interfaces(&self) -> Vec<NetworkInterface> {
        self.state.lock().await.interfaces.values().cloned().collect()
    }

    pub async fn interface(&self, interface_id: &str) -> Option<NetworkInterface> {
        self.state.lock().await.interfaces.get(interface_id).cloned()
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        PoolStatus {
            instance_id: self.config.instance_id.clone(),
            network_id: state.network_id.clone().unwrap_or_default(),
            capacity: state.capacity(),
            leased: state.leased(),
            pending_provisions: state.pending.len(),
            interfaces: state.interfaces.values().cloned().collect(),
        }
    }

    async fn reserve(&self) -> Result<(Uuid, u32, String)> {
        let mut state = self.state.lock().await;
        let network_id = state.network_id.clone().ok_or_else(|| {
            EngineError::InvalidConfiguration("interface pool is not bootstrapped".to_string())
        })?;

        let in_use = state.in_use();
        if in_use >= self.config.max_interfaces {
            return Err(EngineError::CapacityExhausted {
                in_use,
                limit: self.config.max_interfaces,
            });
        }

        let device_index = state.next_device_index();
        let ticket = Uuid::new_v4();
        state.pending.insert(
            ticket,
            PendingProvision {
                state: InterfaceState::Requested,
                device_index,
                subnet_id: None,
            },
        );
        Ok((ticket, device_index, network_id))
    }

    async fn mark_creating(&self, ticket: Uuid, subnet_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let pending = state.pending.get_mut(&ticket).ok_or_else(|| {
            EngineError::InterfaceNotFound(format!("pending provision {}", ticket))
        })?;
        if !pending.state.can_transition_to(InterfaceState::Creating) {
            return Err(EngineError::InvalidTransition {
                interface_id: ticket.to_string(),
                from: pending.state,
                to: InterfaceState::Creating,
            });
        }
        pending.state = InterfaceState::Creating;
        pending.subnet_id = Some(subnet_id.to_string());
        Ok(())
    }

    async fn abandon(&self, ticket: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(pending) = state.pending.remove(&ticket) {
            debug!(%ticket, subnet_id = ?pending.subnet_id, "abandoned provision");
        }
    }

    async fn register_created(&self, ticket: Uuid, interface_id: &str, subnet_id: &str, device_index: u32) {
        let mut state = self.state.lock().await;
        state.pending.remove(&ticket);
        state.interfaces.insert(
            interface_id.to_string(),
            NetworkInterface::new(interface_id, subnet_id, device_index),
        );
    }

    async fn commit_attached(
        &self,
        interface_id: &str,
        description: InterfaceDescription,
    ) -> Result<NetworkInterface> {
        let mut state = self.state.lock().await;
        let iface = state.get_mut(interface_id)?;
        transition(iface, InterfaceState::Attached)?;
        iface.addresses = sorted(description.secondary_addresses);
        iface.idle_since = Some(Utc::now());
        iface.last_error = None;
        let committed = iface.clone();
        self.update_gauges(&state);
        Ok(committed)
    }

    /// Undo a provision that failed after the interface was created
    async fn roll_back(&self, interface_id: &str) {
        let result = match self.detach(interface_id).await {
            Ok(()) => self.delete(interface_id).await,
            Err(err) => Err(err),
        };

        let mut state = self.state.lock().await;
        match result {
            Ok(()) => {
                state.remove(interface_id);
                debug!(interface_id, "rolled back partial provision");
            }
            Err(err) => {
                warn!(interface_id, error = %err, "rollback failed, interface left for cleanup");
                self.mark_error(&mut state, interface_id, &err, Utc::now());
            }
        }
    }

    /// Describe an interface, treating "not attached yet" like "not visible yet"
    async fn describe_attached(&self, interface_id: &str) -> CloudResult<InterfaceDescription> {
        let description = self.cloud.describe_interface(interface_id).await?;
        if description.attachment.is_none() {
            return Err(CloudError::not_yet_visible(interface_id));
        }
        Ok(description)
    }

    async fn detach(&self, interface_id: &str) -> CloudResult<()> {
        retry_cloud(&self.config.cloud_retry, "DetachInterface", || async {
            match self.cloud.detach_interface(interface_id).await {
                Err(err) if err.is_code(codes::ATTACHMENT_NOT_FOUND) => Ok(()),
                other => other,
            }
        })
        .await
    }

    async fn delete(&self, interface_id: &str) -> CloudResult<()> {
        retry_cloud(&self.config.cloud_retry, "DeleteInterface", || async {
            match self.cloud.delete_interface(interface_id).await {
                Err(err) if err.is_code(codes::INTERFACE_NOT_FOUND) => Ok(()),
                other => other,
            }
        })
        .await
    }

    fn mark_error(&self, state: &mut PoolState, interface_id: &str, err: &CloudError, now: DateTime<Utc>) {
        if let Ok(iface) = state.get_mut(interface_id) {
            let _ = transition(iface, InterfaceState::Error);
            iface.last_error = Some(err.to_string());
        }
        let backoff = state
            .error_backoff
            .entry(interface_id.to_string())
            .or_insert(ErrorBackoff {
                attempts: 0,
                next_attempt_at: now,
            });
        backoff.next_attempt_at = now + self.config.error_backoff(backoff.attempts);
        backoff.attempts += 1;
        warn!(interface_id, error = %err, attempts = backoff.attempts, "interface marked as errored");
    }

    fn provision_failed(&self, subnet_id: String, source: CloudError) -> EngineError {
        self.metrics.provision_failures_total.inc();
        warn!(subnet_id = %subnet_id, error = %source, "provisioning failed");
        EngineError::ProvisionFailed { subnet_id, source }
    }

    fn update_gauges(&self, state: &PoolState) {
        self.metrics.address_capacity.set(state.capacity() as i64);
        self.metrics.addresses_leased.set(state.leased() as i64);
        self.metrics.interfaces.set(state.interfaces.len() as i64);
    }
}

fn sorted<T: Ord>(mut values: Vec<T>) -> Vec<T> {
    values.sort();
    values.dedup();
    values
}
