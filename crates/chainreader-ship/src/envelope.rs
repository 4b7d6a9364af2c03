//! Block envelope framing.
//!
//! The node speaks JSON text frames over a WebSocket. The client asks for a
//! block range with a bound on unacknowledged messages, then acknowledges
//! every message it consumes:
//!
//! ```text
//! → {"type":"get_blocks","start_block":100,"end_block":null,"max_messages_in_flight":50,
//!    "have_positions":[{"block_num":99,"block_id":"…"}]}
//! ← {"type":"block","block_num":100,"block_id":"…","prev_id":"…", …}
//! → {"type":"ack","num_messages":1}
//! ← {"type":"fork","block_num":99}
//! ```
//!
//! Row and action payloads stay hex-encoded binary until the decode stage.

use serde::{Deserialize, Serialize};

use chainreader_core::types::BlockPosition;

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    GetBlocks {
        start_block: u64,
        end_block: Option<u64>,
        max_messages_in_flight: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        have_positions: Vec<BlockPosition>,
    },
    Ack {
        num_messages: u32,
    },
}

/// Frames delivered by the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceMessage {
    Block(RawBlock),
    /// Blocks `>= block_num` are replaced by a new branch.
    Fork { block_num: u64 },
}

/// A block as delivered, before ABI decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBlock {
    pub block_num: u64,
    pub block_id: String,
    /// Id of the parent block; empty when the node does not send it.
    #[serde(default)]
    pub prev_id: String,
    /// Seconds since epoch.
    pub timestamp: i64,
    /// Node head at delivery time.
    pub head: u64,
    pub last_irreversible: u64,
    #[serde(default)]
    pub deltas: Vec<RawDelta>,
    #[serde(default)]
    pub traces: Vec<RawTrace>,
}

/// One changed contract table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDelta {
    pub code: String,
    pub table: String,
    pub scope: String,
    pub primary_key: String,
    pub present: bool,
    /// Hex-encoded packed row.
    #[serde(default)]
    pub data: String,
}

/// One executed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrace {
    pub global_sequence: u64,
    pub account: String,
    pub name: String,
    /// Hex-encoded packed payload.
    #[serde(default)]
    pub data: String,
    pub tx_id: String,
    #[serde(default)]
    pub authorization: Vec<String>,
}

impl RawBlock {
    pub fn is_irreversible(&self) -> bool {
        self.block_num <= self.last_irreversible
    }
}
