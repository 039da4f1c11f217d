//! Subnet selection for new secondary interfaces
//!
//! Selection is a deterministic function of a catalog snapshot and the
//! placement policy:
//! - if any subnet in the network carries the eligibility tag, the choice is
//!   restricted to tagged subnets that satisfy the minimum prefix length
//! - otherwise any subnet contained in the network block qualifies, with the
//!   primary interface's subnet preferred

use crate::catalog::{CatalogSnapshot, SubnetCatalog};
use crate::{EngineError, Result};
use eni_api::{Subnet, CNI_ELIGIBLE_TAG};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use tracing::debug;

/// Rule for picking among equally eligible subnets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// Most free addresses first, then larger blocks, then subnet id
    #[default]
    LeastLoaded,
    /// Rotate through candidates ordered by prefix length, then subnet id
    RoundRobin,
}

impl std::str::FromStr for TieBreak {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "least-loaded" | "leastloaded" => Ok(TieBreak::LeastLoaded),
            "round-robin" | "roundrobin" => Ok(TieBreak::RoundRobin),
            other => Err(format!("unknown tie-break rule {:?}", other)),
        }
    }
}

/// Placement policy recomputed for every selection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementPolicy {
    pub tag_key: String,
    /// Candidates must be at least this specific
    pub min_prefix_len: Option<u8>,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            tag_key: CNI_ELIGIBLE_TAG.to_string(),
            min_prefix_len: None,
        }
    }
}

impl PlacementPolicy {
    pub fn admits(&self, subnet: &Subnet) -> bool {
        match self.min_prefix_len {
            Some(min) => subnet.prefix_len() >= min,
            None => true,
        }
    }
}

/// Which branch of the selection rule produced a subnet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionSource {
    Tagged,
    Fallback,
}

#[derive(Clone, Debug)]
pub struct Selection {
    pub subnet: Subnet,
    pub source: SelectionSource,
}

/// Choose a subnet from `snapshot`. `cursor` drives round-robin rotation and
/// is ignored by the least-loaded rule.
pub fn select_from_snapshot(
    snapshot: &CatalogSnapshot,
    policy: &PlacementPolicy,
    tie_break: TieBreak,
    primary_subnet_id: Option<&str>,
    cursor: usize,
) -> Result<Selection> {
    let network_id = &snapshot.network.id;
    if snapshot.subnets.is_empty() {
        return Err(EngineError::NoSubnetsAvailable(network_id.clone()));
    }

    let tagged = snapshot.tagged(&policy.tag_key);
    if !tagged.is_empty() {
        let candidates: Vec<&Subnet> = tagged.into_iter().filter(|s| policy.admits(s)).collect();
        if candidates.is_empty() {
            return Err(EngineError::NoEligibleSubnet {
                network_id: network_id.clone(),
                reason: format!(
                    "no subnet tagged {} is at least /{}",
                    policy.tag_key,
                    policy.min_prefix_len.unwrap_or(0)
                ),
            });
        }
        let subnet = break_tie(candidates, tie_break, cursor);
        return Ok(Selection {
            subnet: subnet.clone(),
            source: SelectionSource::Tagged,
        });
    }

    let candidates: Vec<&Subnet> = snapshot
        .subnets
        .iter()
        .filter(|subnet| snapshot.network.contains_subnet(subnet))
        .collect();
    if candidates.is_empty() {
        return Err(EngineError::NoEligibleSubnet {
            network_id: network_id.clone(),
            reason: format!("no untagged subnet lies within {}", snapshot.network.cidr),
        });
    }

    let preferred = primary_subnet_id
        .and_then(|id| candidates.iter().find(|subnet| subnet.id == id).copied());
    let subnet = match preferred {
        Some(subnet) => subnet,
        None => break_tie(candidates, tie_break, cursor),
    };
    Ok(Selection {
        subnet: subnet.clone(),
        source: SelectionSource::Fallback,
    })
}

fn break_tie(mut candidates: Vec<&Subnet>, tie_break: TieBreak, cursor: usize) -> &Subnet {
    match tie_break {
        TieBreak::LeastLoaded => {
            candidates.sort_by(|a, b| {
                b.available_addresses
                    .cmp(&a.available_addresses)
                    .then(a.prefix_len().cmp(&b.prefix_len()))
                    .then(a.id.cmp(&b.id))
            });
            candidates[0]
        }
        TieBreak::RoundRobin => {
            candidates.sort_by(|a, b| a.prefix_len().cmp(&b.prefix_len()).then(a.id.cmp(&b.id)));
            candidates[cursor % candidates.len()]
        }
    }
}

/// Subnet selector backed by the live catalog
pub struct SubnetSelector {
    catalog: SubnetCatalog,
    tag_key: String,
    tie_break: TieBreak,
    primary_subnet: OnceLock<String>,
    round_robin_counter: AtomicUsize,
}

impl SubnetSelector {
    pub fn new(catalog: SubnetCatalog, tag_key: impl Into<String>, tie_break: TieBreak) -> Self {
        Self {
            catalog,
            tag_key: tag_key.into(),
            tie_break,
            primary_subnet: OnceLock::new(),
            round_robin_counter: AtomicUsize::new(0),
        }
    }

    /// Record the primary interface's subnet. The primary never changes, so
    /// later calls are ignored.
    pub fn set_primary_subnet(&self, subnet_id: impl Into<String>) {
        let _ = self.primary_subnet.set(subnet_id.into());
    }

    pub fn primary_subnet(&self) -> Option<&str> {
        self.primary_subnet.get().map(String::as_str)
    }

    /// Choose the subnet for the next interface in `network_id`
    pub async fn select_subnet(
        &self,
        network_id: &str,
        required_min_prefix_len: Option<u8>,
    ) -> Result<Selection> {
        let snapshot = self.catalog.snapshot(network_id).await?;
        let policy = PlacementPolicy {
            tag_key: self.tag_key.clone(),
            min_prefix_len: required_min_prefix_len,
        };
        let cursor = match self.tie_break {
            TieBreak::RoundRobin => self.round_robin_counter.fetch_add(1, Ordering::SeqCst),
            TieBreak::LeastLoaded => 0,
        };

        let selection = select_from_snapshot(
            &snapshot,
            &policy,
            self.tie_break,
            self.primary_subnet(),
            cursor,
        )?;
        debug!(
            network_id,
            subnet_id = %selection.subnet.id,
            cidr = %selection.subnet.cidr,
            source = ?selection.source,
            "selected subnet"
        );
        Ok(selection)
    }
}
