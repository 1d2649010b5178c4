//! Ensemble and router configuration.
//!
//! The ensemble definition is plain JSON:
//!
//! ```json
//! {
//!   "nodes": [
//!     { "rank": 0, "hostname": "node0", "chassis_id": "chassis-0" },
//!     { "rank": 1, "hostname": "node1", "chassis_id": "chassis-0" }
//!   ]
//! }
//! ```
//!
//! `topology` may be set to `"direct"` or `"hypercube"`; when omitted,
//! ensembles of up to 8 nodes are meshed directly and larger ones as a
//! hypercube of 8-rank partitions.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{chassis_of, Rank, CHASSIS_SIZE};

/// One ensemble member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub rank: Rank,
    pub hostname: String,
    pub chassis_id: String,
}

impl NodeConfig {
    pub fn new(rank: Rank, hostname: impl Into<String>, chassis_id: impl Into<String>) -> Self {
        Self {
            rank,
            hostname: hostname.into(),
            chassis_id: chassis_id.into(),
        }
    }
}

/// Topology family used to mesh the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Every peer reachable over CIO, directly or through one forward.
    Direct,
    /// 8-rank CIO partitions joined by network links.
    Hypercube,
}

/// The full set of nodes to be meshed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub nodes: Vec<NodeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<Topology>,
}

impl EnsembleConfig {
    pub fn new(nodes: Vec<NodeConfig>) -> Self {
        Self {
            nodes,
            topology: None,
        }
    }

    /// Canonical layout for `size` nodes: hostname `node<rank>`,
    /// chassis `chassis-<rank / 4>`.
    pub fn synthetic(size: usize) -> Self {
        let nodes = (0..size as Rank)
            .map(|rank| {
                NodeConfig::new(
                    rank,
                    format!("node{rank}"),
                    format!("chassis-{}", chassis_of(rank)),
                )
            })
            .collect();
        Self::new(nodes)
    }

    /// Force a topology family instead of deriving it from the size.
    #[must_use]
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Topology family, derived from the size unless set explicitly.
    pub fn resolved_topology(&self) -> Topology {
        self.topology.unwrap_or(if self.size() > 8 {
            Topology::Hypercube
        } else {
            Topology::Direct
        })
    }

    pub fn node(&self, rank: Rank) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.rank == rank)
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.node(rank).is_some()
    }

    /// Ranks are unique and numbered 0..N-1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let size = self.size();
        let mut seen = HashSet::with_capacity(size);
        for node in &self.nodes {
            if !seen.insert(node.rank) {
                return Err(ConfigError::DuplicateRank(node.rank));
            }
            if node.rank as usize >= size {
                return Err(ConfigError::RankOutOfRange {
                    rank: node.rank,
                    size,
                });
            }
        }
        Ok(())
    }

    /// Chassis ids must group ranks 4k..4k+3, one id per group.
    pub fn validate_chassis_layout(&self) -> Result<(), ConfigError> {
        let mut by_chassis: BTreeMap<Rank, &str> = BTreeMap::new();
        for node in &self.nodes {
            let index = chassis_of(node.rank);
            match by_chassis.get(&index) {
                Some(id) if *id != node.chassis_id => {
                    return Err(ConfigError::ChassisLayout(format!(
                        "rank {} has chassis {:?}, expected {:?}",
                        node.rank, node.chassis_id, id
                    )));
                }
                Some(_) => {}
                None => {
                    by_chassis.insert(index, &node.chassis_id);
                }
            }
        }

        let mut ids = HashSet::new();
        for (index, id) in &by_chassis {
            if !ids.insert(*id) {
                return Err(ConfigError::ChassisLayout(format!(
                    "chassis {:?} spans more than {} ranks (again at ranks {}..{})",
                    id,
                    CHASSIS_SIZE,
                    index * CHASSIS_SIZE,
                    index * CHASSIS_SIZE + CHASSIS_SIZE - 1
                )));
            }
        }
        Ok(())
    }
}

/// Static inputs for one formation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfiguration {
    /// The local node.
    pub node: NodeConfig,
    pub ensemble: EnsembleConfig,
}

impl RouterConfiguration {
    /// Configuration for the ensemble member with the given rank.
    pub fn new(rank: Rank, ensemble: EnsembleConfig) -> Result<Self, ConfigError> {
        ensemble.validate()?;
        let node = ensemble
            .node(rank)
            .cloned()
            .ok_or(ConfigError::UnknownLocalRank(rank))?;
        Ok(Self { node, ensemble })
    }

    pub fn rank(&self) -> Rank {
        self.node.rank
    }

    pub fn size(&self) -> usize {
        self.ensemble.size()
    }

    /// Re-check the configuration; variants call this before anything else.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ensemble.validate()?;
        match self.ensemble.node(self.node.rank) {
            Some(node) if *node == self.node => Ok(()),
            _ => Err(ConfigError::UnknownLocalRank(self.node.rank)),
        }
    }
}
