//! Garbage collector for idle secondary interfaces

use crate::pool::InterfacePool;
use crate::EngineError;
use chrono::{DateTime, Duration as IdleDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    pub released: Vec<String>,
    /// Releases aborted because addresses were leased mid-release
    pub conflicts: Vec<String>,
    pub failed: Vec<String>,
    /// Idle interfaces kept because the last observed demand still needs them
    pub retained: Vec<String>,
    /// Errored interfaces cleaned up on this pass
    pub recovered: usize,
}

/// Releases interfaces that stayed idle past the cooldown window.
///
/// Failures are logged and picked up again on the next pass.
pub struct GarbageCollector {
    pool: Arc<InterfacePool>,
    cooldown: IdleDuration,
}

impl GarbageCollector {
    pub fn new(pool: Arc<InterfacePool>) -> Self {
        let cooldown = pool.config().idle_cooldown();
        Self { pool, cooldown }
    }

    pub fn with_cooldown(pool: Arc<InterfacePool>, cooldown: IdleDuration) -> Self {
        Self { pool, cooldown }
    }

    pub async fn run_once(&self) -> GcReport {
        self.run_once_at(Utc::now()).await
    }

    /// One pass with `now` as the reference time for idle checks
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> GcReport {
        let mut report = GcReport {
            recovered: self.pool.retry_errored(now).await,
            ..GcReport::default()
        };

        for interface_id in self.pool.idle_candidates(now, self.cooldown).await {
            match self.pool.release_idle(&interface_id).await {
                Ok(()) => report.released.push(interface_id),
                Err(EngineError::CapacityNeeded { remaining, required, .. }) => {
                    debug!(interface_id = %interface_id, remaining, required, "idle interface still needed");
                    report.retained.push(interface_id);
                }
                Err(EngineError::ReleaseConflict { leased, .. }) => {
                    debug!(interface_id = %interface_id, leased, "interface in use again, keeping it");
                    report.conflicts.push(interface_id);
                }
                // Another pass or a lease raced us to this interface
                Err(EngineError::InterfaceNotFound(_)) | Err(EngineError::InvalidTransition { .. }) => {}
                Err(err) => {
                    warn!(interface_id = %interface_id, error = %err, "release failed, retrying next pass");
                    report.failed.push(interface_id);
                }
            }
        }

        if !report.released.is_empty() || report.recovered > 0 {
            info!(
                released = report.released.len(),
                recovered = report.recovered,
                conflicts = report.conflicts.len(),
                retained = report.retained.len(),
                failed = report.failed.len(),
                "garbage collection pass complete"
            );
        }
        report
    }

    /// Collect every `interval` until `shutdown` flips to true
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_once().await;
                    if !report.failed.is_empty() {
                        error!("Garbage collection left {} interfaces unreleased", report.failed.len());
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("garbage collector stopping");
                        return;
                    }
                }
            }
        }
    }
}
