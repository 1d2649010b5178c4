//! Error types for ensemble-router.

use thiserror::Error;

use crate::types::{ChannelId, Direction, Rank};

/// Result type for router operations.
pub type Result<T> = std::result::Result<T, RouterError>;

/// Malformed ensemble definitions, reported synchronously at construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The variant cannot mesh this many nodes.
    #[error("unsupported ensemble size {size} for {variant} topology")]
    UnsupportedSize { size: usize, variant: &'static str },

    /// Two configured nodes claim the same rank.
    #[error("duplicate rank {0} in ensemble configuration")]
    DuplicateRank(Rank),

    /// The local node is not listed in the ensemble.
    #[error("local rank {0} is not a member of the ensemble")]
    UnknownLocalRank(Rank),

    /// Ranks are not numbered 0..N-1.
    #[error("rank {rank} is out of range for an ensemble of {size}")]
    RankOutOfRange { rank: Rank, size: usize },

    /// Chassis ids do not group ranks 4k..4k+3 together.
    #[error("chassis layout invalid: {0}")]
    ChassisLayout(String),

    /// Reading the configuration failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is not valid JSON for the expected shape.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Error surfaced by a Backend implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("backend error: {0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Terminal topology errors and rejected calls.
///
/// Every variant except [`RouterError::Failed`] moves the router into its
/// failed phase and is reported to the delegate exactly once.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The router already failed; the call was rejected.
    #[error("router has already failed: {0}")]
    Failed(String),

    /// A channel came up wired to a node outside the ensemble.
    #[error("channel {channel} is wired to unknown node {node}")]
    UnknownPeer { channel: ChannelId, node: Rank },

    /// A channel reported out of range by the backend.
    #[error("channel {0} does not exist on this node")]
    InvalidChannel(ChannelId),

    /// A wired channel went down.
    #[error("channel {channel} to node {node} was disconnected")]
    ChannelLost { channel: ChannelId, node: Rank },

    /// A confirmed directional connection dropped.
    #[error("{direction} connection on channel {channel} for node {node} was lost")]
    ConnectionLost {
        direction: Direction,
        channel: ChannelId,
        node: Rank,
    },

    /// The out-of-band link to a partition partner dropped.
    #[error("network connection to node {0} was lost")]
    NetworkLost(Rank),

    /// The peer's reported chassis disagrees with the configuration.
    #[error("node {node} reported chassis {reported:?}, configured {configured:?}")]
    ChassisMismatch {
        node: Rank,
        reported: String,
        configured: String,
    },

    /// A CIO channel reaches a node outside the local partition.
    #[error("node {node} on channel {channel} is outside the local partition")]
    OutsidePartition { channel: ChannelId, node: Rank },

    /// A TX leg was confirmed on a channel nobody is wired to.
    #[error("no CIO receiver on channel {0}")]
    MissingReceiver(ChannelId),

    /// A network link came up to a node that is not a partition partner.
    #[error("unexpected network connection from node {0}")]
    UnexpectedNetworkPeer(Rank),

    /// The backend reports a different ensemble size than configured.
    #[error("backend ensemble size {backend} does not match configured size {configured}")]
    SizeMismatch { backend: u32, configured: usize },

    /// The backend refused to activate for this node count.
    #[error("backend cannot activate an ensemble of {0} nodes")]
    CannotActivate(usize),

    /// A backend command failed during formation.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A control message failed to encode or decode.
    #[error("control message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Internal state contradiction. Unreachable under correct event ordering.
    #[error("router invariant violated: {0}")]
    Invariant(&'static str),
}

impl RouterError {
    /// Whether this error rejected a call on an already failed router.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_channel_and_node() {
        let err = RouterError::UnknownPeer {
            channel: ChannelId(2),
            node: 9,
        };
        assert_eq!(err.to_string(), "channel 2 is wired to unknown node 9");

        let err = RouterError::ConnectionLost {
            direction: Direction::Rx,
            channel: ChannelId(1),
            node: 3,
        };
        assert_eq!(err.to_string(), "rx connection on channel 1 for node 3 was lost");
    }

    #[test]
    fn backend_errors_are_transparent() {
        let err: RouterError = BackendError::new("link busy").into();
        assert_eq!(err.to_string(), "backend error: link busy");
        assert!(!err.is_rejection());
        assert!(RouterError::Failed("x".into()).is_rejection());
    }
}
