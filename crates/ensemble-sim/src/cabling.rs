//! Physical cabling plans.
//!
//! Slots are physical positions; slot `s` normally hosts rank `s`. Each
//! slot numbers its ports from a different offset so that no router can
//! rely on a channel id to name its peer.

use serde::{Deserialize, Serialize};

use ensemble_router::types::{MAX_CHANNELS, PARTITION_SIZE};
use ensemble_router::{ChannelId, EnsembleConfig, Topology};

use crate::error::{Result, SimError};

/// Physical position of a node.
pub type Slot = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Port {
    pub slot: Slot,
    pub channel: ChannelId,
}

impl Port {
    /// Port for the `logical`-th cable of `slot`, rotated by the slot index.
    fn rotated(slot: Slot, logical: usize) -> Self {
        let channel = (logical + slot) % usize::from(MAX_CHANNELS);
        Self {
            slot,
            channel: ChannelId(channel as u8),
        }
    }
}

/// A point-to-point cable between two ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cable {
    pub a: Port,
    pub b: Port,
}

impl Cable {
    fn between(a: Port, b: Port) -> Self {
        Self { a, b }
    }

    pub fn touches(&self, slot: Slot) -> bool {
        self.a.slot == slot || self.b.slot == slot
    }

    /// The port at the other end from `port`.
    pub fn far_end(&self, port: Port) -> Option<Port> {
        if self.a == port {
            Some(self.b)
        } else if self.b == port {
            Some(self.a)
        } else {
            None
        }
    }

    /// The end plugged into `slot`.
    pub fn end_at(&self, slot: Slot) -> Option<Port> {
        if self.a.slot == slot {
            Some(self.a)
        } else if self.b.slot == slot {
            Some(self.b)
        } else {
            None
        }
    }
}

/// Every cable of one ensemble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cabling {
    slots: usize,
    cables: Vec<Cable>,
}

impl Cabling {
    /// The canonical plan for a configured ensemble.
    pub fn for_ensemble(config: &EnsembleConfig) -> Result<Self> {
        let size = config.size();
        match (config.resolved_topology(), size) {
            (Topology::Direct, 2) => Ok(Self::pair(1)),
            (Topology::Direct, 4) => Ok(Self::full_mesh()),
            (Topology::Direct, 8) | (Topology::Hypercube, 8 | 16 | 32) => {
                Ok(Self::partitions(size))
            }
            (Topology::Direct, _) => Err(SimError::Unsupported {
                size,
                topology: "direct",
            }),
            (Topology::Hypercube, _) => Err(SimError::Unsupported {
                size,
                topology: "hypercube",
            }),
        }
    }

    /// Two slots joined by `cables` parallel cables (clamped to 1..=4).
    pub fn pair(cables: usize) -> Self {
        let cables = (0..cables.clamp(1, usize::from(MAX_CHANNELS)))
            .map(|k| Cable::between(Port::rotated(0, k), Port::rotated(1, k)))
            .collect();
        Self { slots: 2, cables }
    }

    /// Four slots, one cable per pair.
    pub fn full_mesh() -> Self {
        let mut cables = Vec::new();
        for i in 0..4 {
            for j in (i + 1)..4 {
                cables.push(Cable::between(Port::rotated(i, j - 1), Port::rotated(j, i)));
            }
        }
        Self { slots: 4, cables }
    }

    /// Partitions of 8: each chassis of 4 fully meshed on logical ports
    /// 0..3, logical port 3 to the cross-chassis neighbor.
    pub fn partitions(slots: usize) -> Self {
        let partition = PARTITION_SIZE as usize;
        let mut cables = Vec::new();
        for s in 0..slots {
            let position = s % partition;
            let chassis_base = s - position % 4;
            let a = position % 4;
            for b in (a + 1)..4 {
                cables.push(Cable::between(
                    Port::rotated(s, b - 1),
                    Port::rotated(chassis_base + b, a),
                ));
            }
            if position < 4 {
                cables.push(Cable::between(Port::rotated(s, 3), Port::rotated(s + 4, 3)));
            }
        }
        Self { slots, cables }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn cables(&self) -> &[Cable] {
        &self.cables
    }

    /// Index of the cable plugged into `port`.
    pub fn cable_at(&self, port: Port) -> Option<usize> {
        self.cables
            .iter()
            .position(|c| c.a == port || c.b == port)
    }
}
