//! Block writer — the view of the open transaction given to processors.
//!
//! Every write captures the row's before-image. While the block is
//! reversible the before-image is appended to the undo log in the same
//! transaction, so a later fork can restore the exact previous state.
//! The writer has no commit or rollback: only the reader ends a transaction.

use serde_json::Value;
use tracing::debug;

use crate::checkpoint::ReaderCheckpoint;
use crate::error::IndexerError;
use crate::store::{StoreTx, UndoEntry};

/// Write access to handler tables for the duration of one block.
pub struct BlockWriter<'a> {
    tx: &'a mut dyn StoreTx,
    block_num: u64,
    reversible: bool,
    seq: u32,
    writes: u64,
}

impl<'a> BlockWriter<'a> {
    /// Writer for a block. Undo entries are recorded only when `reversible`.
    pub fn new(tx: &'a mut dyn StoreTx, block_num: u64, reversible: bool) -> Self {
        Self {
            tx,
            block_num,
            reversible,
            seq: 0,
            writes: 0,
        }
    }

    pub fn block_num(&self) -> u64 {
        self.block_num
    }

    pub fn is_reversible(&self) -> bool {
        self.reversible
    }

    /// Number of row writes performed so far.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn reader(&self) -> &str {
        self.tx.reader()
    }

    pub async fn get(&mut self, table: &str, row_key: &str) -> Result<Option<Value>, IndexerError> {
        self.tx.get(table, row_key).await
    }

    pub async fn scan(&mut self, table: &str) -> Result<Vec<(String, Value)>, IndexerError> {
        self.tx.scan(table).await
    }

    /// Insert or replace a row.
    pub async fn upsert(&mut self, table: &str, row_key: &str, value: Value) -> Result<(), IndexerError> {
        let before = self.tx.get(table, row_key).await?;
        self.tx.put(table, row_key, &value).await?;
        self.record(table, row_key, before).await
    }

    /// Delete a row. Returns `false` (and records nothing) if it did not exist.
    pub async fn delete(&mut self, table: &str, row_key: &str) -> Result<bool, IndexerError> {
        let Some(before) = self.tx.get(table, row_key).await? else {
            return Ok(false);
        };
        self.tx.remove(table, row_key).await?;
        self.record(table, row_key, Some(before)).await?;
        Ok(true)
    }

    async fn record(&mut self, table: &str, row_key: &str, before: Option<Value>) -> Result<(), IndexerError> {
        self.writes += 1;
        if !self.reversible {
            return Ok(());
        }
        let entry = UndoEntry {
            block_num: self.block_num,
            seq: self.seq,
            table: table.to_string(),
            row_key: row_key.to_string(),
            before,
        };
        self.seq += 1;
        self.tx.append_undo(&entry).await
    }
}

/// Build a row key from a scope and primary key.
pub fn row_key(scope: &str, primary_key: &str) -> String {
    format!("{scope}/{primary_key}")
}

/// Outcome of [`revert_block`].
#[derive(Debug, Clone, PartialEq)]
pub struct RevertedBlock {
    /// Row entries applied.
    pub entries: usize,
    /// The checkpoint as it was before the block was committed, if recorded.
    pub checkpoint: Option<ReaderCheckpoint>,
}

/// Revert every write of one block by replaying its undo entries newest first.
pub async fn revert_block(tx: &mut dyn StoreTx, block_num: u64) -> Result<RevertedBlock, IndexerError> {
    let entries = tx.take_undo(block_num).await?;
    let mut reverted = RevertedBlock {
        entries: 0,
        checkpoint: None,
    };
    for entry in entries.iter().rev() {
        if entry.is_checkpoint() {
            reverted.checkpoint = entry.checkpoint_before()?;
            continue;
        }
        match &entry.before {
            Some(value) => tx.put(&entry.table, &entry.row_key, value).await?,
            None => {
                tx.remove(&entry.table, &entry.row_key).await?;
            }
        }
        reverted.entries += 1;
    }
    debug!(reader = %tx.reader(), block = block_num, entries = reverted.entries, "block reverted");
    Ok(reverted)
}
