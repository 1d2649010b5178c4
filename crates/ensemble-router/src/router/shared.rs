//! Bookkeeping shared by every topology variant.

use std::collections::BTreeMap;

use tracing::span::EnteredSpan;
use tracing::{debug, error, info, trace, warn, Span};

use crate::backend::{Backend, CableState, ConnectedNode, Delegate};
use crate::config::RouterConfiguration;
use crate::error::{Result, RouterError};
use crate::router::{Route, RouterPhase, Variant};
use crate::transfer_map::TransferMap;
use crate::types::{ChannelId, Direction, NodeState, Rank};
use crate::wire::{ControlMessage, ForwardMessage};

/// Link state, counters and outcome plumbing for one formation attempt.
///
/// Variants compose this and add only their forwarding rule and readiness
/// predicate. Counters cover the CIO-reachable peers (every peer in the
/// direct variants, the local partition in the hypercube) and only ever
/// decrement.
pub struct RouterCore {
    config: RouterConfiguration,
    variant: Variant,
    backend: Box<dyn Backend>,
    delegate: Box<dyn Delegate>,
    span: Span,
    phase: RouterPhase,
    nodes: BTreeMap<Rank, NodeState>,
    cio_map: BTreeMap<ChannelId, Rank>,
    transfer_map: TransferMap,
    expected_tx: usize,
    expected_rx: usize,
}

impl RouterCore {
    /// Seed link state for every ensemble member. `in_partition` says which
    /// peers are reachable over CIO and therefore counted.
    pub(crate) fn new(
        config: RouterConfiguration,
        variant: Variant,
        backend: Box<dyn Backend>,
        delegate: Box<dyn Delegate>,
        in_partition: impl Fn(Rank) -> bool,
    ) -> Self {
        let local = config.rank();
        let nodes: BTreeMap<Rank, NodeState> = config
            .ensemble
            .nodes
            .iter()
            .map(|node| {
                let state = if node.rank == local {
                    NodeState::local(local)
                } else {
                    NodeState::peer(
                        node.rank,
                        node.chassis_id == config.node.chassis_id,
                        in_partition(node.rank),
                    )
                };
                (node.rank, state)
            })
            .collect();
        let expected = nodes
            .values()
            .filter(|n| n.rank != local && n.in_partition)
            .count();

        let span = tracing::debug_span!("router", rank = local, variant = variant.as_str());
        span.in_scope(|| {
            debug!(
                size = config.size(),
                expected_connections = expected,
                "Created ensemble router"
            );
        });

        Self {
            config,
            variant,
            backend,
            delegate,
            span,
            phase: RouterPhase::Coordinating,
            nodes,
            cio_map: BTreeMap::new(),
            transfer_map: TransferMap::new(),
            expected_tx: expected,
            expected_rx: expected,
        }
    }

    /// Replace the span every event is recorded under.
    pub fn set_span(&mut self, span: Span) {
        self.span = span;
    }

    pub fn rank(&self) -> Rank {
        self.config.rank()
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn config(&self) -> &RouterConfiguration {
        &self.config
    }

    pub fn phase(&self) -> &RouterPhase {
        &self.phase
    }

    pub fn is_coordinating(&self) -> bool {
        self.phase == RouterPhase::Coordinating
    }

    pub fn is_ready(&self) -> bool {
        self.phase == RouterPhase::Ready
    }

    pub fn expected_tx(&self) -> usize {
        self.expected_tx
    }

    pub fn expected_rx(&self) -> usize {
        self.expected_rx
    }

    /// Every CIO peer is reachable both ways.
    pub fn cio_complete(&self) -> bool {
        self.expected_tx == 0 && self.expected_rx == 0
    }

    pub fn node(&self, rank: Rank) -> Option<&NodeState> {
        self.nodes.get(&rank)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.values()
    }

    /// Chassis-mates of the local node, excluding itself.
    pub fn chassis_mates(&self) -> Vec<Rank> {
        let local = self.rank();
        self.nodes
            .values()
            .filter(|n| n.in_chassis && n.rank != local)
            .map(|n| n.rank)
            .collect()
    }

    /// Lowest channel wired to `rank`, if any.
    pub fn channel_to(&self, rank: Rank) -> Option<ChannelId> {
        self.cio_map
            .iter()
            .find(|(_, node)| **node == rank)
            .map(|(channel, _)| *channel)
    }

    pub fn cio_map(&self) -> &BTreeMap<ChannelId, Rank> {
        &self.cio_map
    }

    pub fn transfer_map(&self) -> &TransferMap {
        &self.transfer_map
    }

    /// Enter the router span, rejecting the call if the router has failed.
    pub(crate) fn enter(&self) -> Result<EnteredSpan> {
        if let RouterPhase::Failed { reason } = &self.phase {
            self.span.in_scope(|| trace!("Rejecting event on failed router"));
            return Err(RouterError::Failed(reason.clone()));
        }
        Ok(self.span.clone().entered())
    }

    /// Turn a topology error from an event into the terminal failed phase.
    pub(crate) fn settle(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Err(err) if !err.is_rejection() => Err(self.fail(err)),
            other => other,
        }
    }

    fn fail(&mut self, err: RouterError) -> RouterError {
        if let RouterPhase::Failed { .. } = self.phase {
            return err;
        }
        let reason = err.to_string();
        error!(%reason, "Ensemble formation failed");
        self.phase = RouterPhase::Failed {
            reason: reason.clone(),
        };
        self.delegate.ensemble_failed(&reason);
        if let Err(e) = self.backend.deactivate() {
            warn!(error = %e, "Failed to deactivate interconnect after failure");
        }
        err
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        let size = self.config.size();
        let backend_size = self.backend.get_ensemble_size()?;
        if backend_size as usize != size {
            return Err(RouterError::SizeMismatch {
                backend: backend_size,
                configured: size,
            });
        }
        if !self.backend.can_activate(size)? {
            return Err(RouterError::CannotActivate(size));
        }
        self.backend.activate()?;
        debug!("Interconnect activated");
        Ok(())
    }

    /// Common handling of `channel_change`. Returns true when a new wiring
    /// was recorded and the local TX leg requested on it.
    pub(crate) fn handle_channel_change(
        &mut self,
        channel: ChannelId,
        node: Rank,
        chassis_id: &str,
        connected: bool,
    ) -> Result<bool> {
        if !channel.is_valid() {
            return Err(RouterError::InvalidChannel(channel));
        }

        if !connected {
            return match self.cio_map.remove(&channel) {
                Some(node) => Err(RouterError::ChannelLost { channel, node }),
                None => {
                    debug!(%channel, "Ignoring disconnect of an unwired channel");
                    Ok(false)
                }
            };
        }

        if !self.is_coordinating() {
            debug!(%channel, node, "Ignoring channel change after formation");
            return Ok(false);
        }

        let Some(configured) = self.config.ensemble.node(node) else {
            warn!(%channel, node, "Channel wired to a node outside the ensemble, disabling it");
            if let Err(e) = self.backend.disconnect_channel(channel) {
                warn!(%channel, error = %e, "Failed to disable miswired channel");
            }
            return Err(RouterError::UnknownPeer { channel, node });
        };
        if configured.chassis_id != chassis_id {
            return Err(RouterError::ChassisMismatch {
                node,
                reported: chassis_id.to_string(),
                configured: configured.chassis_id.clone(),
            });
        }
        if !self.nodes.get(&node).is_some_and(|n| n.in_partition) {
            return Err(RouterError::OutsidePartition { channel, node });
        }

        if self.cio_map.get(&channel) == Some(&node) {
            trace!(%channel, node, "Channel already recorded");
            return Ok(false);
        }
        // A wired channel moving to another rank loses its old peer.
        if let Some(&previous) = self.cio_map.get(&channel) {
            return Err(RouterError::ChannelLost {
                channel,
                node: previous,
            });
        }
        if node == self.rank() {
            warn!(%channel, "Channel is looped back to the local rank");
        }
        self.cio_map.insert(channel, node);
        debug!(%channel, node, "Channel wired");

        let local = self.rank();
        self.backend.establish_tx_connection(local, channel)?;
        Ok(true)
    }

    /// Common handling of `connection_change`.
    pub(crate) fn handle_connection_change(
        &mut self,
        direction: Direction,
        channel: ChannelId,
        node: Rank,
        connected: bool,
    ) -> Result<()> {
        if !channel.is_valid() {
            return Err(RouterError::InvalidChannel(channel));
        }
        if !connected {
            return Err(RouterError::ConnectionLost {
                direction,
                channel,
                node,
            });
        }
        if !self.nodes.contains_key(&node) {
            return Err(RouterError::UnknownPeer { channel, node });
        }
        match direction {
            Direction::Rx => {
                self.confirm_rx(channel, node);
                Ok(())
            }
            Direction::Tx => self.confirm_tx(channel, node),
        }
    }

    fn confirm_rx(&mut self, channel: ChannelId, origin: Rank) {
        if !self.is_coordinating() {
            trace!(%channel, origin, "Ignoring RX confirmation after formation");
            return;
        }
        if origin == self.rank() {
            warn!(%channel, "Ignoring RX of the local rank's own traffic");
            return;
        }
        let Some(state) = self.nodes.get_mut(&origin) else {
            return;
        };
        if !state.in_partition {
            warn!(%channel, origin, "Ignoring RX from outside the local partition");
            return;
        }
        if state.rx_established {
            let input = self.transfer_map.get(origin).and_then(|s| s.input_channel);
            if input != Some(channel) {
                warn!(%channel, origin, ?input, "Duplicate RX path, keeping the first");
            }
            return;
        }

        state.rx_established = true;
        self.expected_rx = self.expected_rx.saturating_sub(1);
        self.transfer_map.entry(origin).input_channel = Some(channel);
        debug!(
            %channel,
            origin,
            expected_rx = self.expected_rx,
            "RX connection established"
        );
    }

    fn confirm_tx(&mut self, channel: ChannelId, origin: Rank) -> Result<()> {
        let receiver = *self
            .cio_map
            .get(&channel)
            .ok_or(RouterError::MissingReceiver(channel))?;
        let local = self.rank();

        if origin == local {
            // Our own leg: a forward addressed to ourselves, applied in place.
            if self.is_coordinating() {
                self.mark_reachable(receiver, channel);
            } else {
                trace!(%channel, "Ignoring TX confirmation after formation");
            }
            return Ok(());
        }

        if receiver == origin || receiver == local {
            warn!(%channel, origin, receiver, "Ignoring relay that loops back");
            return Ok(());
        }

        let payload = ControlMessage::forward(local, receiver).encode()?;
        self.backend.send_control_message(origin, &payload)?;
        debug!(%channel, origin, receiver, "Relaying traffic, origin notified");
        Ok(())
    }

    /// `receiver` can be reached through `channel`. Returns true on the
    /// first confirmation for that peer.
    fn mark_reachable(&mut self, receiver: Rank, channel: ChannelId) -> bool {
        if receiver == self.rank() {
            trace!(%channel, "Local rank is already reachable");
            return false;
        }
        let Some(state) = self.nodes.get_mut(&receiver) else {
            return false;
        };
        if !state.in_partition {
            return false;
        }

        self.transfer_map.entry(receiver).add_output(channel);
        if state.tx_established {
            return false;
        }
        state.tx_established = true;
        self.expected_tx = self.expected_tx.saturating_sub(1);
        debug!(
            %channel,
            receiver,
            expected_tx = self.expected_tx,
            "TX connection established"
        );
        true
    }

    /// Apply a forward notification from a peer relaying our traffic.
    pub(crate) fn handle_forward(&mut self, forwarder: Rank, receiver: Rank) {
        if !self.is_coordinating() {
            trace!(forwarder, receiver, "Ignoring forward after formation");
            return;
        }
        let Some(channel) = self.channel_to(forwarder) else {
            warn!(forwarder, receiver, "Forward from a node not wired here, ignoring");
            return;
        };
        if !self.nodes.get(&receiver).is_some_and(|n| n.in_partition) {
            warn!(forwarder, receiver, "Forward for an unknown receiver, ignoring");
            return;
        }
        self.mark_reachable(receiver, channel);
    }

    /// Decode a control message. Session traffic goes straight to the
    /// delegate; a forward is returned for the variant to apply.
    pub(crate) fn receive_control(
        &mut self,
        from: Rank,
        payload: &[u8],
    ) -> Result<Option<ForwardMessage>> {
        let _span = self.enter()?;
        let decoded = ControlMessage::decode(payload).map_err(RouterError::from);
        match decoded {
            Ok(ControlMessage::Forward(forward)) => Ok(Some(forward)),
            Ok(ControlMessage::OuterNode { payload }) => {
                trace!(from, len = payload.len(), "Passing outer-node message through");
                self.delegate.outer_node_message(from, payload);
                Ok(None)
            }
            Err(err) => {
                self.settle(Err(err))?;
                Ok(None)
            }
        }
    }

    /// A network partner's link is up both ways.
    pub(crate) fn mark_network_peer(&mut self, rank: Rank) {
        if let Some(state) = self.nodes.get_mut(&rank) {
            state.tx_established = true;
            state.rx_established = true;
        }
    }

    /// Relay `node`'s traffic (or send our own) on `channel`.
    pub(crate) fn establish_tx(&mut self, node: Rank, channel: ChannelId) -> Result<()> {
        self.backend.establish_tx_connection(node, channel)?;
        Ok(())
    }

    pub(crate) fn register_network_peer(&mut self, hostname: &str, rank: Rank) -> Result<()> {
        if !self.backend.add_hostname(hostname, rank)? {
            trace!(hostname, rank, "Hostname already registered");
        }
        self.delegate.add_peer(hostname, rank);
        Ok(())
    }

    /// Fire `ensemble_ready` once: lock the interconnect, freeze the map.
    pub(crate) fn become_ready(&mut self) -> Result<()> {
        if !self.is_coordinating() {
            return Ok(());
        }
        self.backend.lock()?;
        self.phase = RouterPhase::Ready;
        info!(peers = self.transfer_map.len(), "Ensemble ready");
        self.delegate.ensemble_ready(&self.transfer_map);
        Ok(())
    }

    /// Route per rank. `network_via` names the partner carrying traffic to
    /// ranks outside the local partition.
    pub(crate) fn routes(&self, network_via: impl Fn(Rank) -> Option<Rank>) -> BTreeMap<Rank, Route> {
        let local = self.rank();
        self.nodes
            .keys()
            .map(|&rank| {
                let first_output = self
                    .transfer_map
                    .get(rank)
                    .and_then(|s| s.output_channels.first().copied());
                let route = if rank == local {
                    Route::Local
                } else if let Some(channel) = first_output {
                    match self.cio_map.get(&channel) {
                        Some(&via) if via == rank => Route::Direct { channel },
                        Some(&via) => Route::Forwarded { via, channel },
                        None => Route::Unreachable,
                    }
                } else if let Some(via) = network_via(rank) {
                    Route::Network { via }
                } else {
                    Route::Unreachable
                };
                (rank, route)
            })
            .collect()
    }

    pub(crate) fn connected_nodes(&self) -> Result<Vec<ConnectedNode>> {
        Ok(self.backend.get_connected_nodes()?)
    }

    pub(crate) fn cable_state(&self) -> Result<Vec<CableState>> {
        Ok(self.backend.get_cio_cable_state()?)
    }
}
