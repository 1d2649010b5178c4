//! Core identifiers and per-node link state.

use serde::{Deserialize, Serialize};

/// Maximum number of CIO channels on a single node.
pub const MAX_CHANNELS: u8 = 4;

/// Ranks housed by one physical chassis.
pub const CHASSIS_SIZE: u32 = 4;

/// Ranks in one hypercube partition (two chassis joined by CIO).
pub const PARTITION_SIZE: u32 = 8;

/// A node's identity within the ensemble.
pub type Rank = u32;

/// One physical point-to-point interconnect port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u8);

impl ChannelId {
    /// Whether the id names a port that can exist on a node.
    pub const fn is_valid(self) -> bool {
        self.0 < MAX_CHANNELS
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a confirmed connection, relative to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Traffic leaving the local node on the channel.
    Tx,
    /// Traffic arriving at the local node on the channel.
    Rx,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tx => write!(f, "tx"),
            Self::Rx => write!(f, "rx"),
        }
    }
}

/// Chassis index of a rank in the canonical layout.
pub const fn chassis_of(rank: Rank) -> Rank {
    rank / CHASSIS_SIZE
}

/// Partition index of a rank in the hypercube layout.
pub const fn partition_of(rank: Rank) -> Rank {
    rank / PARTITION_SIZE
}

/// The rank at the same position in the other chassis of the partition.
pub const fn cross_chassis_peer(rank: Rank) -> Rank {
    rank ^ CHASSIS_SIZE
}

/// Link state for one ensemble member, as seen by the local router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub rank: Rank,
    /// Shares a physical chassis with the local node.
    pub in_chassis: bool,
    /// Lives in the local 8-rank partition (always true outside the hypercube).
    pub in_partition: bool,
    pub tx_established: bool,
    pub rx_established: bool,
}

impl NodeState {
    /// State for a remote peer with nothing confirmed yet.
    pub fn peer(rank: Rank, in_chassis: bool, in_partition: bool) -> Self {
        Self {
            rank,
            in_chassis,
            in_partition,
            tx_established: false,
            rx_established: false,
        }
    }

    /// The local node's own entry: a self-loop, established both ways.
    pub fn local(rank: Rank) -> Self {
        Self {
            rank,
            in_chassis: true,
            in_partition: true,
            tx_established: true,
            rx_established: true,
        }
    }

    pub fn is_established(&self) -> bool {
        self.tx_established && self.rx_established
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_bounds() {
        assert!(ChannelId(0).is_valid());
        assert!(ChannelId(3).is_valid());
        assert!(!ChannelId(4).is_valid());
    }

    #[test]
    fn layout_helpers() {
        assert_eq!(chassis_of(5), 1);
        assert_eq!(partition_of(5), 0);
        assert_eq!(partition_of(17), 2);
        assert_eq!(cross_chassis_peer(1), 5);
        assert_eq!(cross_chassis_peer(13), 9);
    }

    #[test]
    fn local_entry_is_self_loop() {
        let state = NodeState::local(3);
        assert!(state.is_established());
        assert!(!NodeState::peer(2, true, true).is_established());
    }

    #[test]
    fn direction_display() {
        assert_eq!(Direction::Tx.to_string(), "tx");
        assert_eq!(Direction::Rx.to_string(), "rx");
    }
}
