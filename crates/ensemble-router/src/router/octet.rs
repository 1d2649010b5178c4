//! Eight nodes in two chassis, without a network tier.
//!
//! Chassis-mates are fully meshed; each node's last channel goes to its
//! cross-chassis neighbor. A node relays every chassis-mate's traffic over
//! that cross link, so each rank reaches the far chassis through one hop.

use std::collections::BTreeSet;

use tracing::{debug, trace, warn};

use crate::backend::{Backend, Delegate};
use crate::config::RouterConfiguration;
use crate::error::{ConfigError, Result};
use crate::router::{Router, RouterCore, Variant};
use crate::types::{chassis_of, cross_chassis_peer, ChannelId, Direction, Rank};

pub struct OctetRouter {
    core: RouterCore,
    /// Chassis-mates whose traffic is already relayed across.
    relayed: BTreeSet<Rank>,
}

impl OctetRouter {
    pub fn new(
        config: RouterConfiguration,
        backend: Box<dyn Backend>,
        delegate: Box<dyn Delegate>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        if config.size() != 8 {
            return Err(ConfigError::UnsupportedSize {
                size: config.size(),
                variant: Variant::Octet.as_str(),
            });
        }
        config.ensemble.validate_chassis_layout()?;
        Ok(Self {
            core: RouterCore::new(config, Variant::Octet, backend, delegate, |_| true),
            relayed: BTreeSet::new(),
        })
    }

    /// Mates already relayed across the cross-chassis link.
    pub fn relayed(&self) -> &BTreeSet<Rank> {
        &self.relayed
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
        if recorded && chassis_of(node) != chassis_of(local) && node != cross_chassis_peer(local) {
            warn!(
                %channel,
                node,
                expected = cross_chassis_peer(local),
                "Cross-chassis link reaches an unexpected neighbor"
            );
        }
        self.relay_chassis_traffic()
    }

    /// Relay each chassis-mate whose traffic arrives here over the
    /// cross-chassis link. Needs the mate's RX leg and the cross link wired.
    fn relay_chassis_traffic(&mut self) -> Result<()> {
        let Some(cross) = self.core.channel_to(cross_chassis_peer(self.core.rank())) else {
            trace!("Cross-chassis link not wired yet");
            return Ok(());
        };
        let pending: Vec<Rank> = self
            .core
            .chassis_mates()
            .into_iter()
            .filter(|mate| !self.relayed.contains(mate))
            .filter(|mate| self.core.node(*mate).is_some_and(|n| n.rx_established))
            .collect();
        for mate in pending {
            self.core.establish_tx(mate, cross)?;
            self.relayed.insert(mate);
            debug!(mate, %cross, "Relaying chassis-mate across");
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

impl Router for OctetRouter {
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
        let result = self
            .handle_channel_change(channel, node, chassis_id, connected)
            .and_then(|()| self.evaluate());
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
            .and_then(|()| self.relay_chassis_traffic())
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
