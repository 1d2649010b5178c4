//! Transfer Map: which channel carries each peer's traffic.
//!
//! The exported form is one line per node:
//!
//! ```text
//! rank;inputChannel;outputChannel1,outputChannel2,...
//! ```
//!
//! An unset input channel is written as an empty field.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, Rank};

/// Routing facts for one reachable node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    /// Channel on which this node's traffic arrives locally.
    pub input_channel: Option<ChannelId>,
    /// Channels this node is reachable through, in confirmation order.
    pub output_channels: Vec<ChannelId>,
}

impl TransferState {
    /// Append an output channel. Returns false if it was already present.
    pub fn add_output(&mut self, channel: ChannelId) -> bool {
        if self.output_channels.contains(&channel) {
            return false;
        }
        self.output_channels.push(channel);
        true
    }
}

/// Per-rank transfer states, ordered by rank.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferMap(BTreeMap<Rank, TransferState>);

impl TransferMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, rank: Rank) -> Option<&TransferState> {
        self.0.get(&rank)
    }

    /// Entry for `rank`, created empty if missing.
    pub fn entry(&mut self, rank: Rank) -> &mut TransferState {
        self.0.entry(rank).or_default()
    }

    pub fn insert(&mut self, rank: Rank, state: TransferState) -> Option<TransferState> {
        self.0.insert(rank, state)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Rank, &TransferState)> {
        self.0.iter().map(|(rank, state)| (*rank, state))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ranks whose traffic arrives on `channel`.
    pub fn ranks_on_input(&self, channel: ChannelId) -> Vec<Rank> {
        self.iter()
            .filter(|(_, state)| state.input_channel == Some(channel))
            .map(|(rank, _)| rank)
            .collect()
    }

    /// Render the one-line-per-node export.
    pub fn export(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TransferMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (rank, state) in self.iter() {
            write!(f, "{rank};")?;
            if let Some(input) = state.input_channel {
                write!(f, "{input}")?;
            }
            write!(f, ";")?;
            for (i, channel) in state.output_channels.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{channel}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// A malformed line in an exported transfer map.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transfer map line {line}: {reason}")]
pub struct ParseTransferMapError {
    pub line: usize,
    pub reason: String,
}

impl FromStr for TransferMap {
    type Err = ParseTransferMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut map = TransferMap::new();
        for (index, raw) in s.lines().enumerate() {
            let line = index + 1;
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let err = |reason: String| ParseTransferMapError { line, reason };

            let fields: Vec<&str> = raw.split(';').collect();
            let [rank, input, outputs] = fields.as_slice() else {
                return Err(err(format!("expected 3 fields, found {}", fields.len())));
            };

            let rank: Rank = rank
                .parse()
                .map_err(|_| err(format!("invalid rank {rank:?}")))?;
            let input_channel = if input.is_empty() {
                None
            } else {
                Some(parse_channel(input).map_err(err)?)
            };
            let output_channels = if outputs.is_empty() {
                Vec::new()
            } else {
                outputs
                    .split(',')
                    .map(parse_channel)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(err)?
            };

            if map
                .insert(
                    rank,
                    TransferState {
                        input_channel,
                        output_channels,
                    },
                )
                .is_some()
            {
                return Err(err(format!("rank {rank} listed twice")));
            }
        }
        Ok(map)
    }
}

fn parse_channel(raw: &str) -> Result<ChannelId, String> {
    raw.trim()
        .parse::<u8>()
        .map(ChannelId)
        .map_err(|_| format!("invalid channel {raw:?}"))
}
