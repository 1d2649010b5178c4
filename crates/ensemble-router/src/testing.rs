//! Recording Backend and Delegate for unit tests.

use std::sync::{Arc, Mutex};

use crate::backend::{Backend, CableState, ConnectedNode, Delegate};
use crate::error::BackendError;
use crate::transfer_map::TransferMap;
use crate::types::{ChannelId, Rank};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Activate,
    Deactivate,
    DisconnectChannel(ChannelId),
    EstablishTx { node: Rank, channel: ChannelId },
    SendControl { node: Rank, payload: Vec<u8> },
    Lock,
    AddHostname { hostname: String, node: Rank },
}

#[derive(Debug, Default)]
struct BackendLog {
    commands: Vec<Command>,
    fail_tx: bool,
    fail_lock: bool,
}

/// Records every command; never delivers events.
#[derive(Debug, Clone)]
pub struct RecordingBackend {
    log: Arc<Mutex<BackendLog>>,
    ensemble_size: u32,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::with_size(0)
    }
}

impl RecordingBackend {
    pub fn with_size(ensemble_size: u32) -> Self {
        Self {
            log: Arc::default(),
            ensemble_size,
        }
    }

    pub fn commands(&self) -> Vec<Command> {
        self.log.lock().unwrap().commands.clone()
    }

    pub fn tx_commands(&self) -> Vec<(Rank, ChannelId)> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::EstablishTx { node, channel } => Some((node, channel)),
                _ => None,
            })
            .collect()
    }

    pub fn fail_tx(&self) {
        self.log.lock().unwrap().fail_tx = true;
    }

    pub fn fail_lock(&self) {
        self.log.lock().unwrap().fail_lock = true;
    }

    fn record(&self, command: Command) {
        self.log.lock().unwrap().commands.push(command);
    }
}

impl Backend for RecordingBackend {
    fn activate(&mut self) -> Result<(), BackendError> {
        self.record(Command::Activate);
        Ok(())
    }

    fn deactivate(&mut self) -> Result<(), BackendError> {
        self.record(Command::Deactivate);
        Ok(())
    }

    fn disconnect_channel(&mut self, channel: ChannelId) -> Result<(), BackendError> {
        self.record(Command::DisconnectChannel(channel));
        Ok(())
    }

    fn establish_tx_connection(
        &mut self,
        node: Rank,
        channel: ChannelId,
    ) -> Result<(), BackendError> {
        if self.log.lock().unwrap().fail_tx {
            return Err(BackendError::new("tx refused"));
        }
        self.record(Command::EstablishTx { node, channel });
        Ok(())
    }

    fn send_control_message(&mut self, node: Rank, payload: &[u8]) -> Result<(), BackendError> {
        self.record(Command::SendControl {
            node,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn lock(&mut self) -> Result<(), BackendError> {
        if self.log.lock().unwrap().fail_lock {
            return Err(BackendError::new("lock refused"));
        }
        self.record(Command::Lock);
        Ok(())
    }

    fn get_connected_nodes(&self) -> Result<Vec<ConnectedNode>, BackendError> {
        Ok(Vec::new())
    }

    fn get_cio_cable_state(&self) -> Result<Vec<CableState>, BackendError> {
        Ok(Vec::new())
    }

    fn can_activate(&self, node_count: usize) -> Result<bool, BackendError> {
        Ok(node_count == self.ensemble_size as usize)
    }

    fn add_hostname(&mut self, hostname: &str, node: Rank) -> Result<bool, BackendError> {
        self.record(Command::AddHostname {
            hostname: hostname.to_string(),
            node,
        });
        Ok(true)
    }

    fn get_ensemble_size(&self) -> Result<u32, BackendError> {
        Ok(self.ensemble_size)
    }
}

#[derive(Debug, Default)]
struct DelegateLog {
    ready: Vec<TransferMap>,
    failures: Vec<String>,
    peers: Vec<(String, Rank)>,
    outer: Vec<(Rank, Vec<u8>)>,
}

/// Records every outcome.
#[derive(Debug, Clone, Default)]
pub struct RecordingDelegate {
    log: Arc<Mutex<DelegateLog>>,
}

impl RecordingDelegate {
    pub fn ready(&self) -> Vec<TransferMap> {
        self.log.lock().unwrap().ready.clone()
    }

    pub fn failures(&self) -> Vec<String> {
        self.log.lock().unwrap().failures.clone()
    }

    pub fn peers(&self) -> Vec<(String, Rank)> {
        self.log.lock().unwrap().peers.clone()
    }

    pub fn outer(&self) -> Vec<(Rank, Vec<u8>)> {
        self.log.lock().unwrap().outer.clone()
    }
}

impl Delegate for RecordingDelegate {
    fn ensemble_ready(&mut self, transfer_map: &TransferMap) {
        self.log.lock().unwrap().ready.push(transfer_map.clone());
    }

    fn ensemble_failed(&mut self, reason: &str) {
        self.log.lock().unwrap().failures.push(reason.to_string());
    }

    fn add_peer(&mut self, hostname: &str, rank: Rank) {
        self.log
            .lock()
            .unwrap()
            .peers
            .push((hostname.to_string(), rank));
    }

    fn outer_node_message(&mut self, from: Rank, payload: Vec<u8>) {
        self.log.lock().unwrap().outer.push((from, payload));
    }
}
