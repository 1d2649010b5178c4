//! Hypercube of chassis: 8-rank CIO partitions joined over the network.
//!
//! Inside a partition the wiring matches the 8-node direct layout, but the
//! relay runs the other way. Once a node has seen all three chassis-mates
//! and its cross-chassis partner it relays the partner's traffic to every
//! mate, exactly once. When the partition mesh is complete the router asks
//! for network links to the rank at the same position in every other
//! partition, and becomes ready when all of them are up.

use std::collections::BTreeMap;

use tracing::{debug, info, trace, warn};

use crate::backend::{Backend, Delegate};
use crate::config::RouterConfiguration;
use crate::error::{ConfigError, Result, RouterError};
use crate::router::{Route, Router, RouterCore, Variant};
use crate::types::{
    chassis_of, cross_chassis_peer, partition_of, ChannelId, Direction, NodeState, Rank,
    CHASSIS_SIZE, PARTITION_SIZE,
};

const SUPPORTED_SIZES: [usize; 3] = [8, 16, 32];

/// Latch for relaying the partner's traffic to the chassis-mates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOut {
    Pending,
    Done,
}

/// Latch for requesting the network partners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPhase {
    Idle,
    Requested,
}

/// Out-of-band link to the same position in another partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartnerLink {
    pub hostname: String,
    pub tx_established: bool,
    pub rx_established: bool,
}

impl PartnerLink {
    fn is_up(&self) -> bool {
        self.tx_established && self.rx_established
    }
}

pub struct HypercubeRouter {
    core: RouterCore,
    /// Cross-chassis partner inside the partition, once wired.
    partner: Option<Rank>,
    fan_out: FanOut,
    network: NetworkPhase,
    partners: BTreeMap<Rank, PartnerLink>,
    expected_network: usize,
}

impl HypercubeRouter {
    pub fn new(
        config: RouterConfiguration,
        backend: Box<dyn Backend>,
        delegate: Box<dyn Delegate>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let size = config.size();
        if !SUPPORTED_SIZES.contains(&size) {
            return Err(ConfigError::UnsupportedSize {
                size,
                variant: Variant::Hypercube.as_str(),
            });
        }
        config.ensemble.validate_chassis_layout()?;

        let local = config.rank();
        let partition = partition_of(local);
        let partners: BTreeMap<Rank, PartnerLink> = (0..size as Rank / PARTITION_SIZE)
            .filter(|p| *p != partition)
            .map(|p| p * PARTITION_SIZE + local % PARTITION_SIZE)
            .filter_map(|rank| {
                config.ensemble.node(rank).map(|node| {
                    let link = PartnerLink {
                        hostname: node.hostname.clone(),
                        tx_established: false,
                        rx_established: false,
                    };
                    (rank, link)
                })
            })
            .collect();
        let expected_network = partners.len();

        let core = RouterCore::new(config, Variant::Hypercube, backend, delegate, move |r| {
            partition_of(r) == partition
        });
        Ok(Self {
            core,
            partner: None,
            fan_out: FanOut::Pending,
            network: NetworkPhase::Idle,
            partners,
            expected_network,
        })
    }

    pub fn partner(&self) -> Option<Rank> {
        self.partner
    }

    pub fn fan_out(&self) -> FanOut {
        self.fan_out
    }

    pub fn network_phase(&self) -> NetworkPhase {
        self.network
    }

    pub fn expected_network(&self) -> usize {
        self.expected_network
    }

    pub fn network_partners(&self) -> &BTreeMap<Rank, PartnerLink> {
        &self.partners
    }

    fn handle_channel_change(
        &mut self,
        channel: ChannelId,
        node: Rank,
        chassis_id: &str,
        connected: bool,
    ) -> Result<()> {
        let recorded = self
            .core
            .handle_channel_change(channel, node, chassis_id, connected)?;
        let local = self.core.rank();
        if recorded && chassis_of(node) != chassis_of(local) {
            if node == cross_chassis_peer(local) {
                self.partner = Some(node);
                debug!(%channel, partner = node, "Partner discovered");
            } else {
                warn!(
                    %channel,
                    node,
                    expected = cross_chassis_peer(local),
                    "Cross-chassis link reaches a node that is not the partner"
                );
            }
        }

        if self.fan_out == FanOut::Pending && self.partner.is_some() && self.mates_discovered() {
            self.forward_partner_to_chassis()?;
        }
        Ok(())
    }

    fn mates_discovered(&self) -> bool {
        let mates = self.core.chassis_mates();
        mates.len() == (CHASSIS_SIZE - 1) as usize
            && mates.iter().all(|m| self.core.channel_to(*m).is_some())
    }

    /// Relay the partner's traffic to every chassis-mate.
    fn forward_partner_to_chassis(&mut self) -> Result<()> {
        let partner = self
            .partner
            .ok_or(RouterError::Invariant("partner node not set before fan-out"))?;
        let legs: Vec<(Rank, ChannelId)> = self
            .core
            .chassis_mates()
            .into_iter()
            .filter_map(|mate| self.core.channel_to(mate).map(|channel| (mate, channel)))
            .collect();

        self.fan_out = FanOut::Done;
        for (mate, channel) in legs {
            trace!(partner, mate, %channel, "Relaying partner to chassis-mate");
            self.core.establish_tx(partner, channel)?;
        }
        debug!(partner, "Partner relayed to chassis");
        Ok(())
    }

    fn handle_network_change(&mut self, node: Rank, connected: bool) -> Result<()> {
        let coordinating = self.core.is_coordinating();
        let Some(link) = self.partners.get_mut(&node) else {
            return Err(RouterError::UnexpectedNetworkPeer(node));
        };
        if !connected {
            return Err(RouterError::NetworkLost(node));
        }
        if !coordinating {
            trace!(node, "Ignoring network connection after formation");
            return Ok(());
        }
        if link.is_up() {
            trace!(node, "Network partner already connected");
            return Ok(());
        }
        link.tx_established = true;
        link.rx_established = true;
        self.expected_network = self.expected_network.saturating_sub(1);
        self.core.mark_network_peer(node);
        debug!(
            node,
            expected_network = self.expected_network,
            "Network connection established"
        );
        Ok(())
    }

    fn request_network_partners(&mut self) -> Result<()> {
        self.network = NetworkPhase::Requested;
        info!(
            partners = self.partners.len(),
            "Partition ready, requesting network partners"
        );
        let requests: Vec<(String, Rank)> = self
            .partners
            .iter()
            .map(|(rank, link)| (link.hostname.clone(), *rank))
            .collect();
        for (hostname, rank) in requests {
            self.core.register_network_peer(&hostname, rank)?;
        }
        Ok(())
    }

    fn partner_established(&self) -> bool {
        self.partner
            .and_then(|p| self.core.node(p))
            .is_some_and(NodeState::is_established)
    }

    fn evaluate(&mut self) -> Result<()> {
        if !self.core.is_coordinating() || !self.core.cio_complete() {
            return Ok(());
        }
        if self.network == NetworkPhase::Idle {
            self.request_network_partners()?;
        }
        if self.expected_network == 0 && self.partner_established() {
            self.core.become_ready()?;
        }
        Ok(())
    }
}

impl Router for HypercubeRouter {
    fn core(&self) -> &RouterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RouterCore {
        &mut self.core
    }

    fn channel_change(
        &mut self,
        channel: ChannelId,
        node: Rank,
        chassis_id: &str,
        connected: bool,
    ) -> Result<()> {
        let _span = self.core.enter()?;
        let result = self.handle_channel_change(channel, node, chassis_id, connected);
        self.core.settle(result)
    }

    fn connection_change(
        &mut self,
        direction: Direction,
        channel: ChannelId,
        node: Rank,
        connected: bool,
    ) -> Result<()> {
        let _span = self.core.enter()?;
        let result = self
            .core
            .handle_connection_change(direction, channel, node, connected)
            .and_then(|()| self.evaluate());
        self.core.settle(result)
    }

    fn network_connection_change(&mut self, node: Rank, connected: bool) -> Result<()> {
        let _span = self.core.enter()?;
        let result = self
            .handle_network_change(node, connected)
            .and_then(|()| self.evaluate());
        self.core.settle(result)
    }

    fn forward_message(&mut self, forwarder: Rank, receiver: Rank) -> Result<()> {
        let _span = self.core.enter()?;
        self.core.handle_forward(forwarder, receiver);
        let result = self.evaluate();
        self.core.settle(result)
    }

    fn get_routes(&self) -> BTreeMap<Rank, Route> {
        let local = self.core.rank();
        self.core.routes(|rank| {
            if partition_of(rank) == partition_of(local) {
                return None;
            }
            let via = partition_of(rank) * PARTITION_SIZE + local % PARTITION_SIZE;
            self.partners
                .get(&via)
                .filter(|link| link.is_up())
                .map(|_| via)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnsembleConfig, Topology};
    use crate::router::RouterPhase;
    use crate::testing::{Command, RecordingBackend, RecordingDelegate};
    use crate::wire::ControlMessage;

    fn hypercube(size: usize, rank: Rank) -> (HypercubeRouter, RecordingBackend, RecordingDelegate) {
        let backend = RecordingBackend::with_size(size as u32);
        let delegate = RecordingDelegate::default();
        let ensemble = EnsembleConfig::synthetic(size).with_topology(Topology::Hypercube);
        let config = RouterConfiguration::new(rank, ensemble).unwrap();
        let router = HypercubeRouter::new(config, Box::new(backend.clone()), Box::new(delegate.clone()))
            .unwrap();
        (router, backend, delegate)
    }

    /// Rank 0 wiring: mates 1..3 on channels 0..2, partner 4 on channel 3.
    fn wire(router: &mut HypercubeRouter) {
        for (channel, peer, chassis) in [
            (0, 1, "chassis-0"),
            (1, 2, "chassis-0"),
            (2, 3, "chassis-0"),
            (3, 4, "chassis-1"),
        ] {
            router
                .channel_change(ChannelId(channel), peer, chassis, true)
                .unwrap();
        }
    }

    /// Drive rank 0 to a complete partition mesh.
    fn complete_partition(router: &mut HypercubeRouter) {
        wire(router);
        for (channel, peer) in [(0, 1), (1, 2), (2, 3), (3, 4)] {
            router
                .connection_change(Direction::Rx, ChannelId(channel), peer, true)
                .unwrap();
            router
                .connection_change(Direction::Tx, ChannelId(channel), 0, true)
                .unwrap();
        }
        // Mates relay their partners to us; our partner relays us to its mates.
        for (channel, origin) in [(0, 5), (1, 6), (2, 7)] {
            router
                .connection_change(Direction::Rx, ChannelId(channel), origin, true)
                .unwrap();
        }
        for receiver in [5, 6, 7] {
            router.forward_message(4, receiver).unwrap();
        }
    }

    #[test]
    fn fan_out_runs_once() {
        let (mut router, backend, _) = hypercube(16, 0);
        router.channel_change(ChannelId(3), 4, "chassis-1", true).unwrap();
        router.channel_change(ChannelId(0), 1, "chassis-0", true).unwrap();
        router.channel_change(ChannelId(1), 2, "chassis-0", true).unwrap();
        assert_eq!(router.fan_out(), FanOut::Pending);
        router.channel_change(ChannelId(2), 3, "chassis-0", true).unwrap();
        assert_eq!(router.fan_out(), FanOut::Done);
        assert_eq!(router.partner(), Some(4));

        router.channel_change(ChannelId(2), 3, "chassis-0", true).unwrap();
        router.connection_change(Direction::Rx, ChannelId(3), 4, true).unwrap();

        let relays: Vec<_> = backend
            .tx_commands()
            .into_iter()
            .filter(|(node, _)| *node == 4)
            .collect();
        assert_eq!(
            relays,
            vec![(4, ChannelId(0)), (4, ChannelId(1)), (4, ChannelId(2))]
        );
    }

    #[test]
    fn fan_out_without_partner_is_an_invariant_violation() {
        let (mut router, _, _) = hypercube(8, 0);
        assert!(matches!(
            router.forward_partner_to_chassis(),
            Err(RouterError::Invariant(_))
        ));
        assert_eq!(router.fan_out(), FanOut::Pending);
    }

    #[test]
    fn relaying_partner_notifies_it() {
        let (mut router, backend, _) = hypercube(8, 0);
        wire(&mut router);
        router.connection_change(Direction::Tx, ChannelId(1), 4, true).unwrap();
        let payload = ControlMessage::forward(0, 2).encode().unwrap();
        assert!(backend
            .commands()
            .contains(&Command::SendControl { node: 4, payload }));
    }

    #[test]
    fn single_partition_needs_no_network() {
        let (mut router, backend, delegate) = hypercube(8, 0);
        assert_eq!(router.expected_network(), 0);
        complete_partition(&mut router);
        assert!(router.is_ready());
        assert_eq!(router.network_phase(), NetworkPhase::Requested);
        assert!(delegate.peers().is_empty());
        assert_eq!(delegate.ready().len(), 1);
        assert!(!backend
            .commands()
            .iter()
            .any(|c| matches!(c, Command::AddHostname { .. })));
    }

    #[test]
    fn sixteen_nodes_wait_for_network_partner() {
        let (mut router, backend, delegate) = hypercube(16, 0);
        assert_eq!(router.expected_network(), 1);
        complete_partition(&mut router);
        assert!(!router.is_ready());
        assert_eq!(delegate.peers(), vec![("node8".to_string(), 8)]);
        assert!(backend.commands().contains(&Command::AddHostname {
            hostname: "node8".into(),
            node: 8
        }));

        // A second evaluation does not request again.
        router.forward_message(4, 5).unwrap();
        assert_eq!(delegate.peers().len(), 1);

        router.network_connection_change(8, true).unwrap();
        assert!(router.is_ready());
        assert_eq!(router.expected_network(), 0);

        let routes = router.get_routes();
        assert_eq!(routes[&12], Route::Network { via: 8 });
        assert_eq!(
            routes[&5],
            Route::Forwarded {
                via: 4,
                channel: ChannelId(3)
            }
        );
        let map = router.get_cio_transfer_map();
        assert_eq!(map.len(), 7);
        assert!(map.get(8).is_none());
    }

    #[test]
    fn network_partner_in_each_partition() {
        let (router, _, _) = hypercube(32, 13);
        let partners: Vec<Rank> = router.network_partners().keys().copied().collect();
        assert_eq!(partners, vec![5, 21, 29]);
        assert_eq!(router.expected_network(), 3);
    }

    #[test]
    fn network_errors_are_fatal() {
        let (mut router, _, delegate) = hypercube(16, 0);
        assert!(matches!(
            router.network_connection_change(9, true),
            Err(RouterError::UnexpectedNetworkPeer(9))
        ));
        assert!(router.is_failed());
        assert_eq!(delegate.failures().len(), 1);

        let (mut router, _, _) = hypercube(16, 0);
        complete_partition(&mut router);
        router.network_connection_change(8, true).unwrap();
        assert!(router.is_ready());
        assert!(matches!(
            router.network_connection_change(8, false),
            Err(RouterError::NetworkLost(8))
        ));
        assert!(router.is_failed());
    }

    #[test]
    fn cio_connection_loss_is_fatal() {
        let (mut router, backend, delegate) = hypercube(16, 0);
        complete_partition(&mut router);
        router.network_connection_change(8, true).unwrap();
        assert!(router.is_ready());

        let err = router
            .connection_change(Direction::Tx, ChannelId(1), 0, false)
            .unwrap_err();
        assert!(matches!(err, RouterError::ConnectionLost { node: 0, .. }));
        assert!(matches!(router.phase(), RouterPhase::Failed { .. }));
        assert_eq!(delegate.failures().len(), 1);
        assert!(backend.commands().contains(&Command::Deactivate));

        assert!(router
            .network_connection_change(8, false)
            .unwrap_err()
            .is_rejection());
        assert!(router.forward_message(4, 6).unwrap_err().is_rejection());
        assert_eq!(delegate.failures().len(), 1);
        assert_eq!(delegate.ready().len(), 1);
    }

    #[test]
    fn channel_outside_partition_is_fatal() {
        let (mut router, _, _) = hypercube(16, 0);
        let err = router
            .channel_change(ChannelId(3), 12, "chassis-3", true)
            .unwrap_err();
        assert!(matches!(err, RouterError::OutsidePartition { node: 12, .. }));
    }

    #[test]
    fn wrong_cross_chassis_node_is_not_partner() {
        let (mut router, backend, delegate) = hypercube(8, 0);
        router.channel_change(ChannelId(3), 6, "chassis-1", true).unwrap();
        router.channel_change(ChannelId(0), 1, "chassis-0", true).unwrap();
        router.channel_change(ChannelId(1), 2, "chassis-0", true).unwrap();
        router.channel_change(ChannelId(2), 3, "chassis-0", true).unwrap();
        assert_eq!(router.partner(), None);
        assert_eq!(router.fan_out(), FanOut::Pending);
        assert!(backend.tx_commands().iter().all(|(node, _)| *node == 0));
        assert!(delegate.failures().is_empty());
    }

    #[test]
    fn rejects_unsupported_sizes() {
        for size in [4, 24] {
            let ensemble =
                EnsembleConfig::synthetic(size).with_topology(Topology::Hypercube);
            let config = RouterConfiguration::new(0, ensemble).unwrap();
            let result = HypercubeRouter::new(
                config,
                Box::new(RecordingBackend::default()),
                Box::new(RecordingDelegate::default()),
            );
            assert!(matches!(result, Err(ConfigError::UnsupportedSize { .. })));
        }
    }
}
