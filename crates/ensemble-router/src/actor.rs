//! Confine a router to one tokio task.
//!
//! Router calls must be serialized. [`RouterActor`] owns the router and
//! applies events one at a time from an mpsc queue; [`RouterHandle`] is the
//! cloneable sending side, usable from any task.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::RouterError;
use crate::router::{Router, RouterPhase};
use crate::transfer_map::TransferMap;
use crate::types::{ChannelId, Direction, Rank};

const QUEUE_DEPTH: usize = 256;

/// A backend event, as queued for the router task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouterEvent {
    Start,
    ChannelChange {
        channel: ChannelId,
        node: Rank,
        chassis_id: String,
        connected: bool,
    },
    ConnectionChange {
        direction: Direction,
        channel: ChannelId,
        node: Rank,
        connected: bool,
    },
    NetworkConnectionChange {
        node: Rank,
        connected: bool,
    },
    ForwardMessage {
        forwarder: Rank,
        receiver: Rank,
    },
    ControlMessage {
        from: Rank,
        payload: Vec<u8>,
    },
}

impl RouterEvent {
    /// Deliver the event to `router`.
    pub fn apply(self, router: &mut dyn Router) -> crate::Result<()> {
        match self {
            Self::Start => router.start(),
            Self::ChannelChange {
                channel,
                node,
                chassis_id,
                connected,
            } => router.channel_change(channel, node, &chassis_id, connected),
            Self::ConnectionChange {
                direction,
                channel,
                node,
                connected,
            } => router.connection_change(direction, channel, node, connected),
            Self::NetworkConnectionChange { node, connected } => {
                router.network_connection_change(node, connected)
            }
            Self::ForwardMessage {
                forwarder,
                receiver,
            } => router.forward_message(forwarder, receiver),
            Self::ControlMessage { from, payload } => {
                router.receive_control_message(from, &payload)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("router task has stopped")]
    Closed,

    #[error(transparent)]
    Router(#[from] RouterError),
}

enum Command {
    Event {
        event: RouterEvent,
        reply: Option<oneshot::Sender<crate::Result<()>>>,
    },
    Phase(oneshot::Sender<RouterPhase>),
    TransferMap(oneshot::Sender<TransferMap>),
    Shutdown,
}

/// Sending side of a router task.
#[derive(Clone)]
pub struct RouterHandle {
    rank: Rank,
    tx: mpsc::Sender<Command>,
}

impl RouterHandle {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Queue an event without waiting for its outcome.
    pub async fn send(&self, event: RouterEvent) -> Result<(), ActorError> {
        self.tx
            .send(Command::Event { event, reply: None })
            .await
            .map_err(|_| ActorError::Closed)
    }

    /// Apply an event and wait for the router's verdict.
    pub async fn apply(&self, event: RouterEvent) -> Result<(), ActorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Event {
                event,
                reply: Some(reply),
            })
            .await
            .map_err(|_| ActorError::Closed)?;
        rx.await.map_err(|_| ActorError::Closed)??;
        Ok(())
    }

    pub async fn phase(&self) -> Result<RouterPhase, ActorError> {
        self.query(Command::Phase).await
    }

    pub async fn transfer_map(&self) -> Result<TransferMap, ActorError> {
        self.query(Command::TransferMap).await
    }

    /// Stop the task after the events already queued.
    pub async fn shutdown(&self) -> Result<(), ActorError> {
        self.tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| ActorError::Closed)
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| ActorError::Closed)?;
        rx.await.map_err(|_| ActorError::Closed)
    }
}

/// Task owning one router.
pub struct RouterActor {
    router: Box<dyn Router>,
    rx: mpsc::Receiver<Command>,
}

impl RouterActor {
    /// Spawn the task. It ends on [`RouterHandle::shutdown`] or when every
    /// handle is dropped, and yields the router back.
    pub fn spawn(router: Box<dyn Router>) -> (RouterHandle, JoinHandle<Box<dyn Router>>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let handle = RouterHandle {
            rank: router.rank(),
            tx,
        };
        let actor = Self { router, rx };
        (handle, tokio::spawn(actor.run()))
    }

    async fn run(mut self) -> Box<dyn Router> {
        debug!(rank = self.router.rank(), "Router task started");
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Event { event, reply } => {
                    trace!(?event, "Applying event");
                    let result = event.apply(self.router.as_mut());
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                warn!(rank = self.router.rank(), error = %e, "Event failed");
                            }
                        }
                    }
                }
                Command::Phase(reply) => {
                    let _ = reply.send(self.router.phase().clone());
                }
                Command::TransferMap(reply) => {
                    let _ = reply.send(self.router.get_cio_transfer_map());
                }
                Command::Shutdown => break,
            }
        }
        debug!(rank = self.router.rank(), "Router task stopped");
        self.router
    }
}
