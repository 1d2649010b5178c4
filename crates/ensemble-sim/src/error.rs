//! Error types for ensemble-sim.

use thiserror::Error;

use ensemble_router::{ChannelId, ConfigError, RouterError};

use crate::cabling::Slot;

/// Result type for simulation operations.
pub type Result<T> = std::result::Result<T, SimError>;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("router error: {0}")]
    Router(#[from] RouterError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// No cabling plan exists for this ensemble.
    #[error("no cabling plan for {size} nodes ({topology})")]
    Unsupported { size: usize, topology: &'static str },

    #[error("{claims} claimed ranks for an ensemble of {size}")]
    ClaimCount { claims: usize, size: usize },

    #[error("cabling plan has {slots} slots for an ensemble of {size}")]
    CablingMismatch { slots: usize, size: usize },

    #[error("no slot {0} in the simulation")]
    NoSuchSlot(Slot),

    #[error("no cable on slot {slot} channel {channel}")]
    NoCable { slot: Slot, channel: ChannelId },

    /// The event queue did not drain.
    #[error("simulation did not settle within {steps} steps")]
    Diverged { steps: usize },
}
