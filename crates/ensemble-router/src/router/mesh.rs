//! Two or four nodes, every pair cabled directly.
//!
//! Two nodes may be joined by more than one cable. Those cables are bonded:
//! each confirmed TX leg adds an output channel for the peer and the first
//! confirmed RX fixes its input. Four nodes use one cable per pair, so each
//! node has a spare channel.

use tracing::warn;

use crate::backend::{Backend, Delegate};
use crate::config::RouterConfiguration;
use crate::error::{ConfigError, Result};
use crate::router::{Router, RouterCore, Variant};
use crate::types::{ChannelId, Direction, Rank};

pub struct MeshRouter {
    core: RouterCore,
}

impl MeshRouter {
    pub fn new(
        config: RouterConfiguration,
        backend: Box<dyn Backend>,
        delegate: Box<dyn Delegate>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let variant = match config.size() {
            2 => Variant::Pair,
            4 => Variant::Quad,
            size => {
                return Err(ConfigError::UnsupportedSize {
                    size,
                    variant: "direct mesh",
                })
            }
        };
        Ok(Self {
            core: RouterCore::new(config, variant, backend, delegate, |_| true),
        })
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
        if recorded && self.core.variant() == Variant::Quad {
            let cables = self.core.cio_map().values().filter(|n| **n == node).count();
            if cables > 1 {
                warn!(%channel, node, cables, "Redundant cable in a 4-node mesh");
            }
        }
        Ok(())
    }

    fn evaluate(&mut self) -> Result<()> {
        if self.core.is_coordinating() && self.core.cio_complete() {
            self.core.become_ready()?;
        }
        Ok(())
    }
}

impl Router for MeshRouter {
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

    fn forward_message(&mut self, forwarder: Rank, receiver: Rank) -> Result<()> {
        let _span = self.core.enter()?;
        self.core.handle_forward(forwarder, receiver);
        let result = self.evaluate();
        self.core.settle(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnsembleConfig;
    use crate::error::RouterError;
    use crate::router::{Route, RouterPhase};
    use crate::testing::{Command, RecordingBackend, RecordingDelegate};
    use crate::transfer_map::TransferMap;
    use crate::wire::ControlMessage;

    fn mesh(size: usize, rank: Rank) -> (MeshRouter, RecordingBackend, RecordingDelegate) {
        let backend = RecordingBackend::with_size(size as u32);
        let delegate = RecordingDelegate::default();
        let config = RouterConfiguration::new(rank, EnsembleConfig::synthetic(size)).unwrap();
        let router =
            MeshRouter::new(config, Box::new(backend.clone()), Box::new(delegate.clone())).unwrap();
        (router, backend, delegate)
    }

    fn pair(rank: Rank) -> (MeshRouter, RecordingBackend, RecordingDelegate) {
        mesh(2, rank)
    }

    fn quad(rank: Rank) -> (MeshRouter, RecordingBackend, RecordingDelegate) {
        mesh(4, rank)
    }

    fn wire_all(router: &mut MeshRouter) {
        for (channel, peer) in [(0, 1), (1, 2), (2, 3)] {
            router
                .channel_change(ChannelId(channel), peer, "chassis-0", true)
                .unwrap();
        }
    }

    #[test]
    fn two_node_formation() {
        let (mut router, backend, delegate) = pair(0);

        router.channel_change(ChannelId(0), 1, "chassis-0", true).unwrap();
        assert_eq!(backend.tx_commands(), vec![(0, ChannelId(0))]);

        router.connection_change(Direction::Tx, ChannelId(0), 0, true).unwrap();
        assert_eq!(*router.phase(), RouterPhase::Coordinating);
        router.connection_change(Direction::Rx, ChannelId(0), 1, true).unwrap();

        let expected: TransferMap = "1;0;0\n".parse().unwrap();
        assert_eq!(router.get_cio_transfer_map(), expected);
        assert_eq!(delegate.ready(), vec![expected]);
        assert!(backend.commands().contains(&Command::Lock));
        assert_eq!(
            router.get_routes().get(&1),
            Some(&Route::Direct {
                channel: ChannelId(0)
            })
        );
        assert_eq!(router.get_routes().get(&0), Some(&Route::Local));
    }

    #[test]
    fn bonded_cables() {
        let (mut router, _, delegate) = pair(1);
        router.channel_change(ChannelId(0), 0, "chassis-0", true).unwrap();
        router.channel_change(ChannelId(2), 0, "chassis-0", true).unwrap();
        router.connection_change(Direction::Rx, ChannelId(2), 0, true).unwrap();
        router.connection_change(Direction::Tx, ChannelId(2), 1, true).unwrap();
        assert!(router.is_ready());

        // The second leg arrives after readiness and must not alter the map.
        router.connection_change(Direction::Tx, ChannelId(0), 1, true).unwrap();
        router.connection_change(Direction::Rx, ChannelId(0), 0, true).unwrap();
        assert_eq!(router.get_cio_transfer_map().export(), "0;2;2\n");
        assert_eq!(delegate.ready().len(), 1);
    }

    #[test]
    fn start_checks_backend() {
        let (mut router, backend, _) = pair(0);
        router.start().unwrap();
        assert_eq!(backend.commands(), vec![Command::Activate]);

        let backend = RecordingBackend::with_size(4);
        let delegate = RecordingDelegate::default();
        let config = RouterConfiguration::new(0, EnsembleConfig::synthetic(2)).unwrap();
        let mut router =
            MeshRouter::new(config, Box::new(backend), Box::new(delegate.clone())).unwrap();
        assert!(matches!(
            router.start(),
            Err(RouterError::SizeMismatch {
                backend: 4,
                configured: 2
            })
        ));
        assert!(router.is_failed());
        assert_eq!(delegate.failures().len(), 1);
    }

    #[test]
    fn network_events_are_fatal() {
        let (mut router, _, delegate) = pair(0);
        assert!(router.network_connection_change(1, true).is_err());
        assert!(router.is_failed());
        assert!(delegate.failures()[0].contains("unexpected network connection"));
    }

    #[test]
    fn rejects_wrong_size() {
        for size in [1, 3, 8] {
            let config = RouterConfiguration::new(0, EnsembleConfig::synthetic(size)).unwrap();
            let result = MeshRouter::new(
                config,
                Box::new(RecordingBackend::default()),
                Box::new(RecordingDelegate::default()),
            );
            assert!(matches!(result, Err(ConfigError::UnsupportedSize { .. })));
        }
    }

    #[test]
    fn variant_follows_size() {
        assert_eq!(pair(0).0.variant(), Variant::Pair);
        assert_eq!(quad(3).0.variant(), Variant::Quad);
    }

    #[test]
    fn pair_connection_loss_is_fatal() {
        let (mut router, backend, delegate) = pair(0);
        router.channel_change(ChannelId(0), 1, "chassis-0", true).unwrap();
        router.connection_change(Direction::Tx, ChannelId(0), 0, true).unwrap();
        router.connection_change(Direction::Rx, ChannelId(0), 1, true).unwrap();
        assert!(router.is_ready());

        let err = router
            .connection_change(Direction::Rx, ChannelId(0), 1, false)
            .unwrap_err();
        assert!(matches!(err, RouterError::ConnectionLost { node: 1, .. }));
        assert!(router.is_failed());
        assert_eq!(delegate.failures().len(), 1);
        assert!(backend.commands().contains(&Command::Deactivate));

        assert!(router
            .channel_change(ChannelId(0), 1, "chassis-0", false)
            .unwrap_err()
            .is_rejection());
        assert!(router.forward_message(1, 1).unwrap_err().is_rejection());
        assert_eq!(delegate.failures().len(), 1);
        assert_eq!(delegate.ready().len(), 1);
    }

    #[test]
    fn rewired_channel_fails_instead_of_misrouting() {
        let (mut router, _, delegate) = quad(0);
        router.channel_change(ChannelId(0), 1, "chassis-0", true).unwrap();
        router.connection_change(Direction::Tx, ChannelId(0), 0, true).unwrap();

        let err = router
            .channel_change(ChannelId(0), 2, "chassis-0", true)
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::ChannelLost {
                channel: ChannelId(0),
                node: 1
            }
        ));
        assert!(router.is_failed());
        assert_eq!(delegate.failures().len(), 1);
        assert!(delegate.failures()[0].contains("node 1"));
        assert!(delegate.ready().is_empty());
    }

    #[test]
    fn full_mesh_ready_once() {
        let (mut router, _, delegate) = quad(0);
        wire_all(&mut router);
        for (channel, peer) in [(0, 1), (1, 2), (2, 3)] {
            router
                .connection_change(Direction::Rx, ChannelId(channel), peer, true)
                .unwrap();
            router
                .connection_change(Direction::Tx, ChannelId(channel), 0, true)
                .unwrap();
        }
        assert!(router.is_ready());
        let map = router.get_cio_transfer_map();
        for (channel, peer) in [(0u8, 1), (1, 2), (2, 3)] {
            assert_eq!(map.ranks_on_input(ChannelId(channel)), vec![peer]);
            assert_eq!(map.get(peer).unwrap().output_channels, vec![ChannelId(channel)]);
        }

        router
            .connection_change(Direction::Tx, ChannelId(1), 0, true)
            .unwrap();
        router.forward_message(1, 3).unwrap();
        assert_eq!(delegate.ready().len(), 1);
        assert_eq!(router.get_cio_transfer_map(), map);
    }

    #[test]
    fn unknown_peer_disables_channel() {
        let (mut router, backend, delegate) = quad(0);
        let err = router
            .channel_change(ChannelId(3), 9, "chassis-9", true)
            .unwrap_err();
        assert!(matches!(err, RouterError::UnknownPeer { node: 9, .. }));
        assert!(backend
            .commands()
            .contains(&Command::DisconnectChannel(ChannelId(3))));
        assert_eq!(delegate.failures().len(), 1);
        assert!(delegate.failures()[0].contains("channel 3"));
    }

    #[test]
    fn chassis_mismatch_fails() {
        let (mut router, _, _) = quad(0);
        let err = router
            .channel_change(ChannelId(0), 1, "chassis-7", true)
            .unwrap_err();
        assert!(matches!(err, RouterError::ChassisMismatch { node: 1, .. }));
        assert!(router.is_failed());
    }

    #[test]
    fn failed_router_rejects_everything() {
        let (mut router, backend, delegate) = quad(0);
        wire_all(&mut router);
        router
            .connection_change(Direction::Rx, ChannelId(0), 1, true)
            .unwrap();
        router
            .connection_change(Direction::Rx, ChannelId(0), 1, false)
            .unwrap_err();
        assert!(router.is_failed());
        let issued = backend.commands().len();

        assert!(router
            .channel_change(ChannelId(3), 2, "chassis-0", true)
            .unwrap_err()
            .is_rejection());
        assert!(router
            .connection_change(Direction::Tx, ChannelId(0), 0, true)
            .unwrap_err()
            .is_rejection());
        assert!(router.forward_message(1, 2).unwrap_err().is_rejection());
        assert!(router.start().unwrap_err().is_rejection());
        assert_eq!(backend.commands().len(), issued);
        assert_eq!(delegate.failures().len(), 1);
        assert!(router.is_failed());
    }

    #[test]
    fn backend_command_failure_is_fatal() {
        let (mut router, backend, delegate) = quad(2);
        backend.fail_tx();
        let err = router
            .channel_change(ChannelId(1), 0, "chassis-0", true)
            .unwrap_err();
        assert!(matches!(err, RouterError::Backend(_)));
        assert_eq!(delegate.failures(), vec!["backend error: tx refused".to_string()]);
    }

    #[test]
    fn lock_failure_is_fatal() {
        let (mut router, backend, delegate) = quad(0);
        backend.fail_lock();
        wire_all(&mut router);
        for (channel, peer) in [(0, 1), (1, 2), (2, 3)] {
            router
                .connection_change(Direction::Rx, ChannelId(channel), peer, true)
                .unwrap();
        }
        router.connection_change(Direction::Tx, ChannelId(0), 0, true).unwrap();
        router.connection_change(Direction::Tx, ChannelId(1), 0, true).unwrap();
        assert!(router
            .connection_change(Direction::Tx, ChannelId(2), 0, true)
            .is_err());
        assert!(router.is_failed());
        assert!(delegate.ready().is_empty());
    }

    #[test]
    fn control_messages() {
        let (mut router, _, delegate) = quad(0);
        wire_all(&mut router);

        let outer = ControlMessage::OuterNode {
            payload: b"hello".to_vec(),
        };
        router
            .receive_control_message(2, &outer.encode().unwrap())
            .unwrap();
        assert_eq!(delegate.outer(), vec![(2, b"hello".to_vec())]);

        let forward = ControlMessage::forward(1, 3).encode().unwrap();
        router.receive_control_message(1, &forward).unwrap();
        let state = router.get_cio_transfer_map();
        assert_eq!(state.get(3).unwrap().output_channels, vec![ChannelId(0)]);

        assert!(router.receive_control_message(1, b"garbage").is_err());
        assert!(router.is_failed());
    }
}
