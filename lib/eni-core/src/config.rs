//! Engine configuration
//!
//! Values come from serde defaults, optionally a config file deserialized by
//! the agent, and finally `ENI_*` environment variables.

use crate::retry::RetryPolicy;
use crate::selector::TieBreak;
use crate::{EngineError, Result};
use eni_api::CNI_ELIGIBLE_TAG;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Instance whose interfaces this engine manages
    pub instance_id: String,
    /// Tag key marking subnets eligible for secondary interfaces
    pub eligibility_tag: String,
    /// Tagged subnets must be at least this specific
    pub min_prefix_len: Option<u8>,
    pub tie_break: TieBreak,
    /// Platform limit on interfaces per instance, primary included
    pub max_interfaces: usize,
    /// Leasable addresses requested for each new interface
    pub addresses_per_interface: u32,
    /// Spare addresses kept above demand
    pub warm_address_target: usize,
    /// Provisions issued concurrently in one reconciliation
    pub max_provision_batch: usize,
    pub reconcile_interval_secs: u64,
    pub gc_interval_secs: u64,
    /// Idle time before an interface may be released
    pub idle_cooldown_secs: u64,
    pub error_backoff_initial_secs: u64,
    pub error_backoff_max_secs: u64,
    pub cloud_retry: RetryPolicy,
    pub catalog_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            eligibility_tag: CNI_ELIGIBLE_TAG.to_string(),
            min_prefix_len: None,
            tie_break: TieBreak::default(),
            max_interfaces: 3,
            addresses_per_interface: 10,
            warm_address_target: 0,
            max_provision_batch: 2,
            reconcile_interval_secs: 5,
            gc_interval_secs: 30,
            idle_cooldown_secs: 300,
            error_backoff_initial_secs: 30,
            error_backoff_max_secs: 600,
            cloud_retry: RetryPolicy::default(),
            catalog_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn idle_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_cooldown_secs as i64)
    }

    /// Delay before the next cleanup attempt of an errored interface
    pub fn error_backoff(&self, attempts: u32) -> chrono::Duration {
        let secs = self
            .error_backoff_initial_secs
            .saturating_mul(2u64.saturating_pow(attempts))
            .min(self.error_backoff_max_secs);
        chrono::Duration::seconds(secs as i64)
    }

    /// Apply `ENI_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable name
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ENI_INSTANCE_ID") {
            self.instance_id = value;
        }
        if let Some(value) = lookup("ENI_ELIGIBILITY_TAG") {
            self.eligibility_tag = value;
        }
        if let Some(value) = lookup("ENI_MIN_PREFIX_LEN") {
            self.min_prefix_len = if value.trim().is_empty() {
                None
            } else {
                Some(parse_var("ENI_MIN_PREFIX_LEN", &value)?)
            };
        }
        override_var(&lookup, "ENI_TIE_BREAK", &mut self.tie_break)?;
        override_var(&lookup, "ENI_MAX_INTERFACES", &mut self.max_interfaces)?;
        override_var(&lookup, "ENI_ADDRESSES_PER_INTERFACE", &mut self.addresses_per_interface)?;
        override_var(&lookup, "ENI_WARM_ADDRESS_TARGET", &mut self.warm_address_target)?;
        override_var(&lookup, "ENI_MAX_PROVISION_BATCH", &mut self.max_provision_batch)?;
        override_var(&lookup, "ENI_RECONCILE_INTERVAL_SECS", &mut self.reconcile_interval_secs)?;
        override_var(&lookup, "ENI_GC_INTERVAL_SECS", &mut self.gc_interval_secs)?;
        override_var(&lookup, "ENI_IDLE_COOLDOWN_SECS", &mut self.idle_cooldown_secs)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance_id.trim().is_empty() {
            return Err(invalid("instanceId must be set"));
        }
        if self.eligibility_tag.trim().is_empty() {
            return Err(invalid("eligibilityTag must not be empty"));
        }
        if self.min_prefix_len.is_some_and(|len| len > 32) {
            return Err(invalid("minPrefixLen must be between 0 and 32"));
        }
        if self.max_interfaces < 1 {
            return Err(invalid("maxInterfaces must include the primary interface"));
        }
        if self.addresses_per_interface == 0 {
            return Err(invalid("addressesPerInterface must be positive"));
        }
        if self.max_provision_batch == 0 {
            return Err(invalid("maxProvisionBatch must be positive"));
        }
        if self.reconcile_interval_secs == 0 || self.gc_interval_secs == 0 {
            return Err(invalid("reconcile and GC intervals must be positive"));
        }
        if self.cloud_retry.max_attempts == 0 || self.catalog_retry.max_attempts == 0 {
            return Err(invalid("retry policies need at least one attempt"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> EngineError {
    EngineError::InvalidConfiguration(message.to_string())
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| EngineError::InvalidConfiguration(format!("{}={}: {}", name, value, e)))
}

fn override_var<T, F>(lookup: &F, name: &str, field: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    if let Some(value) = lookup(name) {
        *field = parse_var(name, &value)?;
    }
    Ok(())
}
