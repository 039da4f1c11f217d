//! Demand reconciler
//!
//! Scales the pool up when workload demand exceeds leasable capacity. It
//! never releases capacity; idle interfaces are left to the garbage
//! collector so that transient dips in demand do not cause churn.

use crate::cloud::codes;
use crate::pool::InterfacePool;
use crate::{EngineError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Source of the node's address demand
#[async_trait]
pub trait DemandSource: Send + Sync {
    /// Addresses currently required by workloads on this node
    async fn current_demand(&self) -> Result<usize>;
}

/// Demand set by hand, used in simulation mode and tests
#[derive(Debug, Default)]
pub struct StaticDemand {
    demand: AtomicUsize,
}

impl StaticDemand {
    pub fn new(demand: usize) -> Self {
        Self {
            demand: AtomicUsize::new(demand),
        }
    }

    pub fn set(&self, demand: usize) {
        self.demand.store(demand, Ordering::SeqCst);
    }
}

#[async_trait]
impl DemandSource for StaticDemand {
    async fn current_demand(&self) -> Result<usize> {
        Ok(self.demand.load(Ordering::SeqCst))
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub demand: usize,
    pub capacity_before: usize,
    pub capacity_after: usize,
    /// Interfaces attached during this pass
    pub provisioned: Vec<String>,
    pub failures: Vec<EngineError>,
    /// The interface limit stopped capacity from covering demand
    pub capacity_exhausted: bool,
}

impl ReconcileReport {
    pub fn is_satisfied(&self) -> bool {
        self.capacity_after >= self.demand
    }
}

pub struct DemandReconciler {
    pool: Arc<InterfacePool>,
    demand: Arc<dyn DemandSource>,
}

impl DemandReconciler {
    pub fn new(pool: Arc<InterfacePool>, demand: Arc<dyn DemandSource>) -> Self {
        Self { pool, demand }
    }

    /// Provision interfaces in batches until `current_capacity` plus the
    /// new interfaces covers `current_demand` and the warm target, or the
    /// interface limit is reached.
    pub async fn reconcile(&self, current_demand: usize, current_capacity: usize) -> ReconcileReport {
        let config = self.pool.config();
        self.pool.record_demand(current_demand).await;
        let target = current_demand.saturating_add(config.warm_address_target);
        let per_interface = (config.addresses_per_interface as usize).max(1);

        let mut report = ReconcileReport {
            demand: current_demand,
            capacity_before: current_capacity,
            capacity_after: current_capacity,
            ..ReconcileReport::default()
        };

        let mut capacity = current_capacity;
        while capacity < target {
            let needed = (target - capacity).div_ceil(per_interface);
            let room = self.pool.available_slots().await;
            if room < needed {
                report.capacity_exhausted = true;
            }
            let batch = needed.min(room).min(config.max_provision_batch);
            if batch == 0 {
                break;
            }

            debug!(needed, room, batch, "provisioning interfaces");
            let results = join_all((0..batch).map(|_| self.pool.provision())).await;

            let mut progressed = false;
            for result in results {
                match result {
                    Ok(iface) => {
                        progressed = true;
                        report.provisioned.push(iface.id);
                    }
                    Err(err) => {
                        if hit_interface_limit(&err) {
                            report.capacity_exhausted = true;
                        }
                        report.failures.push(err);
                    }
                }
            }

            capacity = self.pool.capacity().await;
            if !progressed {
                break;
            }
        }
        report.capacity_after = capacity;

        if report.capacity_exhausted {
            self.pool.metrics().capacity_exhausted_total.inc();
            warn!(
                demand = current_demand,
                capacity,
                limit = config.max_interfaces,
                "capacity exhausted, interface limit reached"
            );
        }
        report
    }

    /// Read demand and capacity, then reconcile
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let demand = self.demand.current_demand().await?;
        self.pool.metrics().address_demand.set(demand as i64);
        let capacity = self.pool.capacity().await;

        let report = self.reconcile(demand, capacity).await;
        for failure in &report.failures {
            if failure.is_operator_actionable() {
                error!(error = %failure, "provisioning needs operator attention");
            } else {
                warn!(error = %failure, "provisioning failed, retrying next cycle");
            }
        }
        if !report.provisioned.is_empty() {
            info!(
                demand,
                capacity_before = report.capacity_before,
                capacity_after = report.capacity_after,
                provisioned = report.provisioned.len(),
                "reconciled address capacity"
            );
        }
        Ok(report)
    }

    /// Reconcile every `interval` until `shutdown` flips to true
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Reconciliation failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("demand reconciler stopping");
                        return;
                    }
                }
            }
        }
    }
}

fn hit_interface_limit(err: &EngineError) -> bool {
    match err {
        EngineError::CapacityExhausted { .. } => true,
        EngineError::ProvisionFailed { source, .. } => {
            source.is_code(codes::ATTACHMENT_LIMIT_EXCEEDED)
        }
        _ => false,
    }
}
