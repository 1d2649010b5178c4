//! Topology-formation state machines.
//!
//! Every variant implements [`Router`]; [`build`] selects one from the
//! ensemble size and topology family. Shared bookkeeping (link state, the
//! CIO map, counters, the transfer map, failure handling) lives in
//! [`RouterCore`], which each variant owns.

mod shared;
mod hypercube;
mod mesh;
mod octet;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::Span;

use crate::backend::{Backend, CableState, ConnectedNode, Delegate};
use crate::config::{RouterConfiguration, Topology};
use crate::error::{ConfigError, Result, RouterError};
use crate::transfer_map::TransferMap;
use crate::types::{ChannelId, Direction, NodeState, Rank};

pub use shared::RouterCore;
pub use hypercube::{FanOut, HypercubeRouter, NetworkPhase, PartnerLink};
pub use mesh::MeshRouter;
pub use octet::OctetRouter;

/// Which state machine drives formation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Pair,
    Quad,
    Octet,
    Hypercube,
}

impl Variant {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pair => "2-node",
            Self::Quad => "4-node",
            Self::Octet => "8-node",
            Self::Hypercube => "hypercube",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single formation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouterPhase {
    /// Formation in progress.
    Coordinating,
    /// `ensemble_ready` has fired; the transfer map is frozen.
    Ready,
    /// `ensemble_failed` has fired; the instance is spent.
    Failed { reason: String },
}

impl fmt::Display for RouterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coordinating => write!(f, "Coordinating"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed { reason } => write!(f, "Failed: {reason}"),
        }
    }
}

/// How traffic for a rank leaves the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Route {
    Local,
    Direct { channel: ChannelId },
    Forwarded { via: Rank, channel: ChannelId },
    /// Over the network link to `via`, the partition partner.
    Network { via: Rank },
    Unreachable,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Direct { channel } => write!(f, "direct on channel {channel}"),
            Self::Forwarded { via, channel } => {
                write!(f, "forwarded by {via} on channel {channel}")
            }
            Self::Network { via } => write!(f, "network via {via}"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// The operation set shared by every topology variant.
///
/// Calls must be serialized: one event at a time, no reentrancy. Errors
/// other than [`RouterError::Failed`] have already moved the router into
/// [`RouterPhase::Failed`] and been reported to the delegate when they are
/// returned.
///
/// Variants supply the wiring events and their forwarding rule; everything
/// else runs on the [`RouterCore`] they own.
pub trait Router: Send {
    fn core(&self) -> &RouterCore;

    fn core_mut(&mut self) -> &mut RouterCore;

    /// `channel` is now (or no longer) wired to `node` in chassis `chassis_id`.
    fn channel_change(
        &mut self,
        channel: ChannelId,
        node: Rank,
        chassis_id: &str,
        connected: bool,
    ) -> Result<()>;

    /// A directional connection carrying `node`'s traffic on `channel`
    /// was confirmed (or dropped).
    fn connection_change(
        &mut self,
        direction: Direction,
        channel: ChannelId,
        node: Rank,
        connected: bool,
    ) -> Result<()>;

    /// `forwarder` now relays the local node's traffic to `receiver`.
    fn forward_message(&mut self, forwarder: Rank, receiver: Rank) -> Result<()>;

    /// An out-of-band network link to a partition partner came up (or down).
    /// Only the hypercube has network partners; anywhere else this is fatal.
    fn network_connection_change(&mut self, node: Rank, _connected: bool) -> Result<()> {
        let core = self.core_mut();
        let _span = core.enter()?;
        core.settle(Err(RouterError::UnexpectedNetworkPeer(node)))
    }

    /// Check the backend agrees on the ensemble, then activate it.
    fn start(&mut self) -> Result<()> {
        let core = self.core_mut();
        let _span = core.enter()?;
        let result = core.start();
        core.settle(result)
    }

    /// Decode a control message from `from` and act on it.
    fn receive_control_message(&mut self, from: Rank, payload: &[u8]) -> Result<()> {
        let forward = self.core_mut().receive_control(from, payload)?;
        match forward {
            Some(forward) => self.forward_message(forward.forwarder, forward.receiver),
            None => Ok(()),
        }
    }

    /// Record every later event under `span` instead of the default
    /// `router{rank, variant}` span.
    fn set_span(&mut self, span: Span) {
        self.core_mut().set_span(span);
    }

    fn variant(&self) -> Variant {
        self.core().variant()
    }

    fn rank(&self) -> Rank {
        self.core().rank()
    }

    fn phase(&self) -> &RouterPhase {
        self.core().phase()
    }

    fn node_states(&self) -> Vec<NodeState> {
        self.core().nodes().cloned().collect()
    }

    fn get_cio_transfer_map(&self) -> TransferMap {
        self.core().transfer_map().clone()
    }

    fn get_routes(&self) -> BTreeMap<Rank, Route> {
        self.core().routes(|_| None)
    }

    fn connected_nodes(&self) -> Result<Vec<ConnectedNode>> {
        self.core().connected_nodes()
    }

    fn cable_state(&self) -> Result<Vec<CableState>> {
        self.core().cable_state()
    }

    fn is_ready(&self) -> bool {
        *self.phase() == RouterPhase::Ready
    }

    fn is_failed(&self) -> bool {
        matches!(self.phase(), RouterPhase::Failed { .. })
    }
}

/// Construct the variant matching the configured ensemble.
pub fn build(
    config: RouterConfiguration,
    backend: Box<dyn Backend>,
    delegate: Box<dyn Delegate>,
) -> std::result::Result<Box<dyn Router>, ConfigError> {
    let size = config.size();
    let router: Box<dyn Router> = match (config.ensemble.resolved_topology(), size) {
        (Topology::Direct, 2 | 4) => Box::new(MeshRouter::new(config, backend, delegate)?),
        (Topology::Direct, 8) => Box::new(OctetRouter::new(config, backend, delegate)?),
        (Topology::Hypercube, _) => Box::new(HypercubeRouter::new(config, backend, delegate)?),
        (Topology::Direct, size) => {
            return Err(ConfigError::UnsupportedSize {
                size,
                variant: "direct",
            })
        }
    };
    Ok(router)
}

/// [`build`], with every event recorded under `span`.
pub fn build_with_span(
    config: RouterConfiguration,
    backend: Box<dyn Backend>,
    delegate: Box<dyn Delegate>,
    span: Span,
) -> std::result::Result<Box<dyn Router>, ConfigError> {
    let mut router = build(config, backend, delegate)?;
    router.set_span(span);
    Ok(router)
}
