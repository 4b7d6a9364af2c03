//! Reader checkpoint — the single source of truth for resume position.
//!
//! One row per reader. It is written as the last statement of every block
//! transaction, so it never points past a block whose writes did not commit.

use serde::{Deserialize, Serialize};

use crate::types::{BlockHeader, BlockPosition};

/// A persisted checkpoint for a reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderCheckpoint {
    /// Reader name.
    pub reader: String,
    /// Last committed block number (0 before the first block).
    pub block_num: u64,
    /// Id of the last committed block.
    pub block_id: String,
    /// Timestamp of the last committed block (seconds since epoch).
    pub block_time: i64,
    /// Highest irreversible block the node reported at commit time.
    pub irreversible: u64,
    /// `true` once the reader is caught up with the chain head.
    pub live: bool,
    /// Wall time of the last update (seconds since epoch).
    pub updated_at: i64,
}

impl ReaderCheckpoint {
    /// The row created on a reader's first run.
    pub fn genesis(reader: impl Into<String>) -> Self {
        Self {
            reader: reader.into(),
            block_num: 0,
            block_id: String::new(),
            block_time: 0,
            irreversible: 0,
            live: false,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Checkpoint after committing `header`.
    pub fn advance(&self, header: &BlockHeader, live: bool) -> Self {
        Self {
            reader: self.reader.clone(),
            block_num: header.number,
            block_id: header.id.clone(),
            block_time: header.timestamp,
            irreversible: self.irreversible.max(header.last_irreversible),
            live,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Checkpoint after reverting `block_num`; the reader now sits on the block before it.
    ///
    /// `before` is the checkpoint recorded when `block_num` was committed. Without
    /// it the id of the parent block is unknown and left empty. The irreversible
    /// block never moves back.
    pub fn rewind(&self, block_num: u64, before: Option<ReaderCheckpoint>) -> Self {
        let parent = block_num.saturating_sub(1);
        match before {
            Some(before) if before.block_num == parent => Self {
                reader: self.reader.clone(),
                irreversible: self.irreversible.max(before.irreversible),
                updated_at: chrono::Utc::now().timestamp(),
                ..before
            },
            _ => Self {
                reader: self.reader.clone(),
                block_num: parent,
                block_id: String::new(),
                block_time: self.block_time,
                irreversible: self.irreversible,
                live: self.live,
                updated_at: chrono::Utc::now().timestamp(),
            },
        }
    }

    /// The committed block, once there is one with a known id.
    pub fn position(&self) -> Option<BlockPosition> {
        (self.block_num > 0 && !self.block_id.is_empty()).then(|| BlockPosition {
            block_num: self.block_num,
            block_id: self.block_id.clone(),
        })
    }

    /// First block to request from the node.
    pub fn next_block(&self) -> u64 {
        self.block_num + 1
    }
}
