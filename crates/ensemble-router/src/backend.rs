//! Seams to the interconnect (Backend) and the outcome consumer (Delegate).
//!
//! The router never blocks on either: every Backend command is
//! fire-and-forget and its failure is reported synchronously.

use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::transfer_map::TransferMap;
use crate::types::{ChannelId, Rank};

/// A node the backend currently sees on the interconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedNode {
    pub rank: Rank,
    pub chassis_id: String,
    pub channel: ChannelId,
}

/// Physical cable state of one local port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CableState {
    pub channel: ChannelId,
    pub cable_connected: bool,
    /// Rank on the far end, once known.
    pub peer: Option<Rank>,
}

/// Channel-level primitives of the local interconnect.
///
/// Events flow the other way: the backend calls the router's
/// `channel_change`, `connection_change` and `network_connection_change`.
pub trait Backend: Send {
    /// Bring the whole interconnect up.
    fn activate(&mut self) -> Result<(), BackendError>;

    /// Take the whole interconnect down.
    fn deactivate(&mut self) -> Result<(), BackendError>;

    /// Disable a single port.
    fn disconnect_channel(&mut self, channel: ChannelId) -> Result<(), BackendError>;

    /// Transmit `node`'s traffic (the local node's own, or relayed) on `channel`.
    fn establish_tx_connection(&mut self, node: Rank, channel: ChannelId)
        -> Result<(), BackendError>;

    /// Send a small control message to `node`.
    fn send_control_message(&mut self, node: Rank, payload: &[u8]) -> Result<(), BackendError>;

    /// Freeze the interconnect configuration once the mesh is formed.
    fn lock(&mut self) -> Result<(), BackendError>;

    fn get_connected_nodes(&self) -> Result<Vec<ConnectedNode>, BackendError>;

    fn get_cio_cable_state(&self) -> Result<Vec<CableState>, BackendError>;

    fn can_activate(&self, node_count: usize) -> Result<bool, BackendError>;

    /// Register a hostname for a rank. Returns false if it was already known.
    fn add_hostname(&mut self, hostname: &str, node: Rank) -> Result<bool, BackendError>;

    fn get_ensemble_size(&self) -> Result<u32, BackendError>;
}

/// Consumer of router outcomes.
pub trait Delegate: Send {
    /// The ensemble is fully meshed. Fires at most once per router.
    fn ensemble_ready(&mut self, transfer_map: &TransferMap);

    /// Formation failed. Fires at most once per router.
    fn ensemble_failed(&mut self, reason: &str);

    /// Request an out-of-band network connection to a partition partner.
    fn add_peer(&mut self, hostname: &str, rank: Rank);

    /// Session traffic received on the control path.
    fn outer_node_message(&mut self, from: Rank, payload: Vec<u8>) {
        tracing::trace!(from, len = payload.len(), "Dropping outer-node message");
    }
}
