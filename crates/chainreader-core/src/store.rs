//! Storage traits.
//!
//! A [`Store`] hands out one [`StoreTx`] per unit of work. Everything a block
//! touches (handler rows, undo entries, the checkpoint) goes through the same
//! transaction, so a block is either fully visible or not at all.
//!
//! Handler tables are relational tables of `(reader, row_key, value)` where
//! `value` is the JSON document of the row. Readers never see each other's rows.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checkpoint::ReaderCheckpoint;
use crate::error::IndexerError;

/// Inverse of one write performed while processing a reversible block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoEntry {
    pub block_num: u64,
    /// Order of the write within its block.
    pub seq: u32,
    pub table: String,
    pub row_key: String,
    /// Row value before the write; `None` if the row did not exist.
    pub before: Option<Value>,
}

/// A storage backend.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a transaction scoped to `reader`.
    async fn begin(&self, reader: &str) -> Result<Box<dyn StoreTx>, IndexerError>;

    /// Read a checkpoint outside of any transaction.
    async fn load_checkpoint(&self, reader: &str) -> Result<Option<ReaderCheckpoint>, IndexerError>;
}

/// An open transaction. Dropping it without [`StoreTx::commit`] rolls it back.
#[async_trait]
pub trait StoreTx: Send {
    /// The reader this transaction belongs to.
    fn reader(&self) -> &str;

    // ── handler tables ──────────────────────────────────────────────────────

    /// Create a handler table if missing. Returns `true` if it was created.
    async fn create_table(&mut self, table: &str) -> Result<bool, IndexerError>;

    async fn get(&mut self, table: &str, row_key: &str) -> Result<Option<Value>, IndexerError>;

    async fn put(&mut self, table: &str, row_key: &str, value: &Value) -> Result<(), IndexerError>;

    /// Remove a row. Returns `true` if it existed.
    async fn remove(&mut self, table: &str, row_key: &str) -> Result<bool, IndexerError>;

    /// All rows of this reader in `table`, ordered by key.
    async fn scan(&mut self, table: &str) -> Result<Vec<(String, Value)>, IndexerError>;

    /// Delete every row of this reader in `table`. Returns the number removed.
    /// A missing table counts as empty.
    async fn clear_table(&mut self, table: &str) -> Result<u64, IndexerError>;

    // ── undo log ───────────────────────────────────────────────────────────

    async fn append_undo(&mut self, entry: &UndoEntry) -> Result<(), IndexerError>;

    /// The undo entries of one block in ascending `seq`, left in place.
    async fn undo_entries(&mut self, block_num: u64) -> Result<Vec<UndoEntry>, IndexerError>;

    /// Distinct block numbers `>= from_block` that still have undo entries, descending.
    async fn undo_blocks_from(&mut self, from_block: u64) -> Result<Vec<u64>, IndexerError>;

    /// Remove and return the undo entries of one block, in ascending `seq`.
    async fn take_undo(&mut self, block_num: u64) -> Result<Vec<UndoEntry>, IndexerError>;

    /// Discard undo entries of blocks `<= up_to` (they became irreversible).
    async fn prune_undo(&mut self, up_to: u64) -> Result<u64, IndexerError>;

    /// Discard the whole undo log of this reader.
    async fn clear_undo(&mut self) -> Result<(), IndexerError>;

    // ── checkpoint & schema versions ───────────────────────────────────────

    async fn load_checkpoint(&mut self) -> Result<Option<ReaderCheckpoint>, IndexerError>;

    async fn save_checkpoint(&mut self, checkpoint: &ReaderCheckpoint) -> Result<(), IndexerError>;

    async fn delete_checkpoint(&mut self) -> Result<(), IndexerError>;

    async fn schema_version(&mut self, handler: &str) -> Result<Option<u32>, IndexerError>;

    async fn set_schema_version(&mut self, handler: &str, version: u32) -> Result<(), IndexerError>;

    /// Forget the recorded schema version, so the next start treats the handler as new.
    async fn delete_schema_version(&mut self, handler: &str) -> Result<(), IndexerError>;

    // ── completion ─────────────────────────────────────────────────────────

    async fn commit(self: Box<Self>) -> Result<(), IndexerError>;

    async fn rollback(self: Box<Self>) -> Result<(), IndexerError>;
}

/// Reject table names that are not plain lowercase identifiers.
///
/// Table names end up in DDL, so only `[a-z_][a-z0-9_]*` is accepted.
pub fn validate_table_name(table: &str) -> Result<(), IndexerError> {
    let mut chars = table.chars();
    let valid_head = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if RESERVED_TABLES.contains(&table) {
        Err(IndexerError::Storage(format!("table name '{table}' is reserved")))
    } else if valid_head && valid_tail && table.len() <= 63 {
        Ok(())
    } else {
        Err(IndexerError::Storage(format!("invalid table name '{table}'")))
    }
}

/// Reserved names used by the pipeline itself.
pub const RESERVED_TABLES: &[&str] = &[CHECKPOINT_TABLE, "reader_undo", "handler_versions"];

/// Table name of the checkpoints; undo entries naming it hold a checkpoint before-image.
pub const CHECKPOINT_TABLE: &str = "reader_checkpoints";

impl UndoEntry {
    /// Undo entry restoring `before` when block `block_num` is reverted.
    ///
    /// It sorts after every row entry of the block.
    pub fn checkpoint(block_num: u64, before: &ReaderCheckpoint) -> Result<Self, IndexerError> {
        let value = serde_json::to_value(before).map_err(|e| IndexerError::Storage(e.to_string()))?;
        Ok(Self {
            block_num,
            seq: u32::MAX,
            table: CHECKPOINT_TABLE.to_string(),
            row_key: before.reader.clone(),
            before: Some(value),
        })
    }

    pub fn is_checkpoint(&self) -> bool {
        self.table == CHECKPOINT_TABLE
    }

    /// The checkpoint before-image held by this entry, if it is one.
    pub fn checkpoint_before(&self) -> Result<Option<ReaderCheckpoint>, IndexerError> {
        match (&self.before, self.is_checkpoint()) {
            (Some(value), true) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| IndexerError::Storage(format!("corrupt checkpoint undo entry: {e}"))),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names() {
        assert!(validate_table_name("token_accounts").is_ok());
        assert!(validate_table_name("_tmp2").is_ok());
        assert!(validate_table_name("Accounts").is_err());
        assert!(validate_table_name("1st").is_err());
        assert!(validate_table_name("a; DROP TABLE x").is_err());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("reader_undo").is_err());
        assert!(validate_table_name(CHECKPOINT_TABLE).is_err());
    }

    #[test]
    fn checkpoint_undo_entry_carries_the_previous_checkpoint() {
        let cp = ReaderCheckpoint::genesis("main");
        let entry = UndoEntry::checkpoint(7, &cp).unwrap();
        assert!(entry.is_checkpoint());
        assert_eq!(entry.seq, u32::MAX);
        assert_eq!(entry.checkpoint_before().unwrap(), Some(cp));

        let row = UndoEntry {
            block_num: 7,
            seq: 0,
            table: "accounts".into(),
            row_key: "alice".into(),
            before: None,
        };
        assert_eq!(row.checkpoint_before().unwrap(), None);
    }
}
