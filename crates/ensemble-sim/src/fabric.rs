//! In-memory interconnect shared by every simulated node.
//!
//! Backend commands turn into events queued for the affected slots. The
//! queue is a single FIFO, so delivery order is deterministic for a given
//! boot order.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, trace};

use ensemble_router::types::MAX_CHANNELS;
use ensemble_router::{
    Backend, BackendError, CableState, ChannelId, ConnectedNode, Delegate, Direction, Rank,
    RouterEvent, TransferMap,
};

use crate::cabling::{Cabling, Port, Slot};

/// An event waiting for a slot's router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub slot: Slot,
    pub event: RouterEvent,
}

/// Everything one slot's backend and delegate were asked to do.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SlotReport {
    pub ready: Vec<TransferMap>,
    pub failures: Vec<String>,
    /// `establish_tx_connection` calls, in order.
    pub tx_requests: Vec<(Rank, ChannelId)>,
    pub control_messages: usize,
    pub hostnames: BTreeSet<(String, Rank)>,
    pub network_requests: Vec<(String, Rank)>,
    pub outer: Vec<(Rank, Vec<u8>)>,
    pub locked: bool,
}

pub(crate) struct Fabric {
    cabling: Cabling,
    claims: Vec<Rank>,
    chassis: Vec<String>,
    active: Vec<bool>,
    /// Indices of cables currently up.
    live: BTreeSet<usize>,
    queue: VecDeque<Delivery>,
    requested: BTreeSet<(Slot, Rank)>,
    links: BTreeSet<(Slot, Slot)>,
    reports: Vec<SlotReport>,
}

pub(crate) type SharedFabric = Arc<Mutex<Fabric>>;

/// Lock the fabric. A router panicking mid-event leaves the state usable.
pub(crate) fn lock_fabric(fabric: &SharedFabric) -> MutexGuard<'_, Fabric> {
    fabric.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Fabric {
    pub(crate) fn new(cabling: Cabling, claims: Vec<Rank>, chassis: Vec<String>) -> Self {
        let slots = cabling.slots();
        Self {
            cabling,
            claims,
            chassis,
            active: vec![false; slots],
            live: BTreeSet::new(),
            queue: VecDeque::new(),
            requested: BTreeSet::new(),
            links: BTreeSet::new(),
            reports: vec![SlotReport::default(); slots],
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Delivery> {
        self.queue.pop_front()
    }

    pub(crate) fn push(&mut self, slot: Slot, event: RouterEvent) {
        self.queue.push_back(Delivery { slot, event });
    }

    pub(crate) fn report(&self, slot: Slot) -> Option<&SlotReport> {
        self.reports.get(slot)
    }

    fn report_mut(&mut self, slot: Slot) -> Option<&mut SlotReport> {
        self.reports.get_mut(slot)
    }

    fn channel_event(&self, at: Port, far: Port, connected: bool) -> Delivery {
        Delivery {
            slot: at.slot,
            event: RouterEvent::ChannelChange {
                channel: at.channel,
                node: self.claims[far.slot],
                chassis_id: self.chassis[far.slot].clone(),
                connected,
            },
        }
    }

    /// Bring up a slot and every cable whose far end is already up.
    fn activate(&mut self, slot: Slot) {
        self.active[slot] = true;
        let cables: Vec<(usize, Port, Port)> = self
            .cabling
            .cables()
            .iter()
            .enumerate()
            .filter_map(|(index, cable)| {
                let near = cable.end_at(slot)?;
                let far = cable.far_end(near)?;
                Some((index, near, far))
            })
            .collect();
        for (index, near, far) in cables {
            if !self.active[far.slot] || self.live.contains(&index) {
                continue;
            }
            self.live.insert(index);
            trace!(?near, ?far, "Cable up");
            let events = [
                self.channel_event(near, far, true),
                self.channel_event(far, near, true),
            ];
            self.queue.extend(events);
        }
    }

    /// Take a slot down and tell every neighbor, over CIO or the network,
    /// that its link went dark.
    fn deactivate(&mut self, slot: Slot) {
        self.active[slot] = false;
        let cables: Vec<(usize, Port, Port)> = self
            .live
            .iter()
            .filter_map(|index| {
                let cable = self.cabling.cables().get(*index)?;
                let near = cable.end_at(slot)?;
                Some((*index, near, cable.far_end(near)?))
            })
            .collect();
        for (index, near, far) in cables {
            self.live.remove(&index);
            let event = self.channel_event(far, near, false);
            self.queue.push_back(event);
        }

        let me = self.claims[slot];
        let links: Vec<(Slot, Slot)> = self
            .links
            .iter()
            .filter(|(a, b)| *a == slot || *b == slot)
            .copied()
            .collect();
        for (a, b) in links {
            self.links.remove(&(a, b));
            let partner = if a == slot { b } else { a };
            debug!(slot, partner, "Network link down");
            self.push(
                partner,
                RouterEvent::NetworkConnectionChange {
                    node: me,
                    connected: false,
                },
            );
        }
    }

    /// Pull the cable at `port`. Both ends see the disconnect when `both`.
    pub(crate) fn unplug(&mut self, port: Port, both: bool) -> bool {
        let Some(index) = self.cabling.cable_at(port) else {
            return false;
        };
        if !self.live.remove(&index) {
            return true;
        }
        let Some(far) = self.cabling.cables()[index].far_end(port) else {
            return true;
        };
        let event = self.channel_event(far, port, false);
        self.queue.push_back(event);
        if both {
            let event = self.channel_event(port, far, false);
            self.queue.push_back(event);
        }
        true
    }

    fn live_cable(&self, port: Port) -> Option<Port> {
        let index = self.cabling.cable_at(port)?;
        if !self.live.contains(&index) {
            return None;
        }
        self.cabling.cables()[index].far_end(port)
    }

    fn establish_tx(&mut self, slot: Slot, node: Rank, channel: ChannelId) -> Result<(), BackendError> {
        let port = Port { slot, channel };
        let far = self
            .live_cable(port)
            .ok_or_else(|| BackendError::new(format!("channel {channel} is not connected")))?;
        if let Some(report) = self.report_mut(slot) {
            report.tx_requests.push((node, channel));
        }
        self.push(
            slot,
            RouterEvent::ConnectionChange {
                direction: Direction::Tx,
                channel,
                node,
                connected: true,
            },
        );
        self.push(
            far.slot,
            RouterEvent::ConnectionChange {
                direction: Direction::Rx,
                channel: far.channel,
                node,
                connected: true,
            },
        );
        Ok(())
    }

    /// Deliver to every active slot claiming `node`.
    fn send_control(&mut self, slot: Slot, node: Rank, payload: &[u8]) {
        let from = self.claims[slot];
        let targets: Vec<Slot> = (0..self.claims.len())
            .filter(|t| self.claims[*t] == node && self.active[*t])
            .collect();
        if targets.is_empty() {
            debug!(from, node, "Control message has no recipient");
        }
        if let Some(report) = self.report_mut(slot) {
            report.control_messages += 1;
        }
        for target in targets {
            self.push(
                target,
                RouterEvent::ControlMessage {
                    from,
                    payload: payload.to_vec(),
                },
            );
        }
    }

    /// Record a network request and bring the link up once both ends asked.
    fn request_network_peer(&mut self, slot: Slot, hostname: &str, rank: Rank) {
        let me = self.claims[slot];
        self.requested.insert((slot, rank));
        if let Some(report) = self.report_mut(slot) {
            report.network_requests.push((hostname.to_string(), rank));
        }
        let partners: Vec<Slot> = (0..self.claims.len())
            .filter(|t| {
                self.claims[*t] == rank
                    && self.active[*t]
                    && self.requested.contains(&(*t, me))
                    && !self.links.contains(&(slot.min(*t), slot.max(*t)))
            })
            .collect();
        for partner in partners {
            self.links.insert((slot.min(partner), slot.max(partner)));
            debug!(slot, partner, "Network link up");
            self.push(
                slot,
                RouterEvent::NetworkConnectionChange {
                    node: rank,
                    connected: true,
                },
            );
            self.push(
                partner,
                RouterEvent::NetworkConnectionChange {
                    node: me,
                    connected: true,
                },
            );
        }
    }
}

/// Backend handle for one slot.
pub struct SimBackend {
    slot: Slot,
    fabric: SharedFabric,
}

impl SimBackend {
    pub(crate) fn new(slot: Slot, fabric: SharedFabric) -> Self {
        Self { slot, fabric }
    }
}

impl Backend for SimBackend {
    fn activate(&mut self) -> Result<(), BackendError> {
        trace!(slot = self.slot, "activate");
        lock_fabric(&self.fabric).activate(self.slot);
        Ok(())
    }

    fn deactivate(&mut self) -> Result<(), BackendError> {
        trace!(slot = self.slot, "deactivate");
        lock_fabric(&self.fabric).deactivate(self.slot);
        Ok(())
    }

    fn disconnect_channel(&mut self, channel: ChannelId) -> Result<(), BackendError> {
        trace!(slot = self.slot, %channel, "disconnect_channel");
        lock_fabric(&self.fabric).unplug(Port { slot: self.slot, channel }, false);
        Ok(())
    }

    fn establish_tx_connection(
        &mut self,
        node: Rank,
        channel: ChannelId,
    ) -> Result<(), BackendError> {
        trace!(slot = self.slot, node, %channel, "establish_tx_connection");
        lock_fabric(&self.fabric).establish_tx(self.slot, node, channel)
    }

    fn send_control_message(&mut self, node: Rank, payload: &[u8]) -> Result<(), BackendError> {
        trace!(slot = self.slot, node, len = payload.len(), "send_control_message");
        lock_fabric(&self.fabric).send_control(self.slot, node, payload);
        Ok(())
    }

    fn lock(&mut self) -> Result<(), BackendError> {
        if let Some(report) = lock_fabric(&self.fabric).report_mut(self.slot) {
            report.locked = true;
        }
        Ok(())
    }

    fn get_connected_nodes(&self) -> Result<Vec<ConnectedNode>, BackendError> {
        let fabric = lock_fabric(&self.fabric);
        let nodes = (0..MAX_CHANNELS)
            .filter_map(|c| {
                let port = Port {
                    slot: self.slot,
                    channel: ChannelId(c),
                };
                let far = fabric.live_cable(port)?;
                Some(ConnectedNode {
                    rank: fabric.claims[far.slot],
                    chassis_id: fabric.chassis[far.slot].clone(),
                    channel: port.channel,
                })
            })
            .collect();
        Ok(nodes)
    }

    fn get_cio_cable_state(&self) -> Result<Vec<CableState>, BackendError> {
        let fabric = lock_fabric(&self.fabric);
        let states = (0..MAX_CHANNELS)
            .map(|c| {
                let port = Port {
                    slot: self.slot,
                    channel: ChannelId(c),
                };
                let peer = fabric.live_cable(port).map(|far| fabric.claims[far.slot]);
                CableState {
                    channel: port.channel,
                    cable_connected: peer.is_some(),
                    peer,
                }
            })
            .collect();
        Ok(states)
    }

    fn can_activate(&self, node_count: usize) -> Result<bool, BackendError> {
        Ok(node_count == lock_fabric(&self.fabric).claims.len())
    }

    fn add_hostname(&mut self, hostname: &str, node: Rank) -> Result<bool, BackendError> {
        let mut fabric = lock_fabric(&self.fabric);
        let report = fabric
            .report_mut(self.slot)
            .ok_or_else(|| BackendError::new("slot out of range"))?;
        Ok(report.hostnames.insert((hostname.to_string(), node)))
    }

    fn get_ensemble_size(&self) -> Result<u32, BackendError> {
        Ok(lock_fabric(&self.fabric).claims.len() as u32)
    }
}

/// Delegate handle for one slot.
pub struct SimDelegate {
    slot: Slot,
    fabric: SharedFabric,
}

impl SimDelegate {
    pub(crate) fn new(slot: Slot, fabric: SharedFabric) -> Self {
        Self { slot, fabric }
    }
}

impl Delegate for SimDelegate {
    fn ensemble_ready(&mut self, transfer_map: &TransferMap) {
        debug!(slot = self.slot, "Slot ready");
        if let Some(report) = lock_fabric(&self.fabric).report_mut(self.slot) {
            report.ready.push(transfer_map.clone());
        }
    }

    fn ensemble_failed(&mut self, reason: &str) {
        debug!(slot = self.slot, reason, "Slot failed");
        if let Some(report) = lock_fabric(&self.fabric).report_mut(self.slot) {
            report.failures.push(reason.to_string());
        }
    }

    fn add_peer(&mut self, hostname: &str, rank: Rank) {
        lock_fabric(&self.fabric).request_network_peer(self.slot, hostname, rank);
    }

    fn outer_node_message(&mut self, from: Rank, payload: Vec<u8>) {
        if let Some(report) = lock_fabric(&self.fabric).report_mut(self.slot) {
            report.outer.push((from, payload));
        }
    }
}
