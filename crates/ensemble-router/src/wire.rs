//! Control messages carried over the interconnect's control path.
//!
//! Messages are JSON objects tagged by `type`:
//!
//! ```text
//! {"type":"forward","forwarder":4,"receiver":1}
//! {"type":"outer_node","payload":[...]}
//! ```

use serde::{Deserialize, Serialize};

use crate::types::Rank;

/// `forwarder` now relays the recipient's traffic to `receiver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardMessage {
    pub forwarder: Rank,
    pub receiver: Rank,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Forward(ForwardMessage),
    /// Session traffic for the delegate, passed through untouched.
    OuterNode { payload: Vec<u8> },
}

impl ControlMessage {
    pub fn forward(forwarder: Rank, receiver: Rank) -> Self {
        Self::Forward(ForwardMessage {
            forwarder,
            receiver,
        })
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
