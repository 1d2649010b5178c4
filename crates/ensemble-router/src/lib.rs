//! Ensemble Router - Leaderless Topology Formation over CIO Interconnects
//!
//! A small ensemble of compute nodes is cabled together with point-to-point
//! interconnect channels (at most four per node). Each node runs a router
//! that watches link and connection events on its own channels and, without
//! a coordinator, converges on a [`TransferMap`]: which channel delivers each
//! peer's traffic and which channel(s) reach it.
//!
//! # Topologies
//!
//! | Ensemble | Router | Shape |
//! |----------|--------|-------|
//! | 2 | [`MeshRouter`] | one or more bonded cables |
//! | 4 | [`MeshRouter`] | full mesh |
//! | 8 | [`OctetRouter`] | two chassis, chassis-mates relayed across |
//! | 8, 16, 32 | [`HypercubeRouter`] | 8-rank partitions joined by network links |
//!
//! Peers that are not cabled directly are reached through one forward by a
//! chassis-mate or the cross-chassis neighbor. The relaying node tells the
//! origin about the new path with a [`ControlMessage::Forward`].
//!
//! # Example
//!
//! ```rust,ignore
//! use ensemble_router::{build, EnsembleConfig, RouterConfiguration};
//!
//! let config = RouterConfiguration::new(0, EnsembleConfig::synthetic(4))?;
//! let mut router = build(config, Box::new(backend), Box::new(delegate))?;
//! router.start()?;
//!
//! // Feed backend events until the delegate sees ensemble_ready.
//! router.channel_change(ChannelId(0), 1, "chassis-0", true)?;
//! ```

pub mod actor;
pub mod backend;
pub mod config;
pub mod error;
pub mod router;
pub mod transfer_map;
pub mod types;
pub mod wire;

#[cfg(test)]
mod testing;

pub use actor::{ActorError, RouterActor, RouterEvent, RouterHandle};
pub use backend::{Backend, CableState, ConnectedNode, Delegate};
pub use config::{EnsembleConfig, NodeConfig, RouterConfiguration, Topology};
pub use error::{BackendError, ConfigError, Result, RouterError};
pub use router::{
    build, build_with_span, HypercubeRouter, MeshRouter, OctetRouter, Route, Router,
    RouterCore, RouterPhase, Variant,
};
pub use transfer_map::{ParseTransferMapError, TransferMap, TransferState};
pub use types::{ChannelId, Direction, NodeState, Rank};
pub use wire::{ControlMessage, ForwardMessage};
