//! In-memory store for tests and ephemeral readers.
//!
//! A transaction holds the store lock for its whole lifetime and journals the
//! previous value of everything it touches; rollback (explicit or on drop)
//! replays the journal backwards.
//!
//! One lock guards the whole store, so a `MemoryStore` serves one reader.
//! Readers running side by side each get their own store (or use SQLite).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::checkpoint::ReaderCheckpoint;
use crate::error::IndexerError;
use crate::store::{validate_table_name, Store, StoreTx, UndoEntry};

type RowMap = BTreeMap<(String, String), Value>;
type UndoKey = (String, u64, u32);

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, RowMap>,
    checkpoints: HashMap<String, ReaderCheckpoint>,
    undo: BTreeMap<UndoKey, UndoEntry>,
    versions: HashMap<(String, String), u32>,
}

/// Previous value of something a transaction changed.
enum Change {
    TableCreated(String),
    Row {
        table: String,
        key: (String, String),
        before: Option<Value>,
    },
    Undo {
        key: UndoKey,
        before: Option<UndoEntry>,
    },
    Checkpoint {
        reader: String,
        before: Option<ReaderCheckpoint>,
    },
    Version {
        key: (String, String),
        before: Option<u32>,
    },
}

/// In-memory store for a single reader. Cloning shares the underlying data
/// and the lock.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows of `reader` in `table`, ordered by key.
    pub async fn rows(&self, reader: &str, table: &str) -> BTreeMap<String, Value> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|((r, _), _)| r == reader)
                    .map(|((_, k), v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of committed undo entries of `reader`.
    pub async fn undo_len(&self, reader: &str) -> usize {
        let state = self.state.lock().await;
        state.undo.keys().filter(|(r, _, _)| r == reader).count()
    }

    pub async fn has_table(&self, table: &str) -> bool {
        self.state.lock().await.tables.contains_key(table)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self, reader: &str) -> Result<Box<dyn StoreTx>, IndexerError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        Ok(Box::new(MemoryTx {
            reader: reader.to_string(),
            state: guard,
            journal: Vec::new(),
            done: false,
        }))
    }

    async fn load_checkpoint(&self, reader: &str) -> Result<Option<ReaderCheckpoint>, IndexerError> {
        Ok(self.state.lock().await.checkpoints.get(reader).cloned())
    }
}

struct MemoryTx {
    reader: String,
    state: OwnedMutexGuard<MemoryState>,
    journal: Vec<Change>,
    done: bool,
}

impl MemoryTx {
    fn table_mut(&mut self, table: &str) -> Result<&mut RowMap, IndexerError> {
        self.state
            .tables
            .get_mut(table)
            .ok_or_else(|| IndexerError::Storage(format!("no such table '{table}'")))
    }

    fn row_key(&self, row_key: &str) -> (String, String) {
        (self.reader.clone(), row_key.to_string())
    }

    fn revert(&mut self) {
        while let Some(change) = self.journal.pop() {
            let state = &mut *self.state;
            match change {
                Change::TableCreated(table) => {
                    state.tables.remove(&table);
                }
                Change::Row { table, key, before } => {
                    if let Some(rows) = state.tables.get_mut(&table) {
                        match before {
                            Some(v) => rows.insert(key, v),
                            None => rows.remove(&key),
                        };
                    }
                }
                Change::Undo { key, before } => {
                    match before {
                        Some(e) => state.undo.insert(key, e),
                        None => state.undo.remove(&key),
                    };
                }
                Change::Checkpoint { reader, before } => {
                    match before {
                        Some(cp) => state.checkpoints.insert(reader, cp),
                        None => state.checkpoints.remove(&reader),
                    };
                }
                Change::Version { key, before } => {
                    match before {
                        Some(v) => state.versions.insert(key, v),
                        None => state.versions.remove(&key),
                    };
                }
            }
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.done {
            self.revert();
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    fn reader(&self) -> &str {
        &self.reader
    }

    async fn create_table(&mut self, table: &str) -> Result<bool, IndexerError> {
        validate_table_name(table)?;
        if self.state.tables.contains_key(table) {
            return Ok(false);
        }
        self.state.tables.insert(table.to_string(), RowMap::new());
        self.journal.push(Change::TableCreated(table.to_string()));
        Ok(true)
    }

    async fn get(&mut self, table: &str, row_key: &str) -> Result<Option<Value>, IndexerError> {
        let key = self.row_key(row_key);
        Ok(self.table_mut(table)?.get(&key).cloned())
    }

    async fn put(&mut self, table: &str, row_key: &str, value: &Value) -> Result<(), IndexerError> {
        let key = self.row_key(row_key);
        let before = self.table_mut(table)?.insert(key.clone(), value.clone());
        self.journal.push(Change::Row {
            table: table.to_string(),
            key,
            before,
        });
        Ok(())
    }

    async fn remove(&mut self, table: &str, row_key: &str) -> Result<bool, IndexerError> {
        let key = self.row_key(row_key);
        let before = self.table_mut(table)?.remove(&key);
        let existed = before.is_some();
        if existed {
            self.journal.push(Change::Row {
                table: table.to_string(),
                key,
                before,
            });
        }
        Ok(existed)
    }

    async fn scan(&mut self, table: &str) -> Result<Vec<(String, Value)>, IndexerError> {
        let reader = self.reader.clone();
        Ok(self
            .table_mut(table)?
            .iter()
            .filter(|((r, _), _)| *r == reader)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn clear_table(&mut self, table: &str) -> Result<u64, IndexerError> {
        if !self.state.tables.contains_key(table) {
            return Ok(0);
        }
        let keys: Vec<String> = self.scan(table).await?.into_iter().map(|(k, _)| k).collect();
        for key in &keys {
            self.remove(table, key).await?;
        }
        Ok(keys.len() as u64)
    }

    async fn append_undo(&mut self, entry: &UndoEntry) -> Result<(), IndexerError> {
        let key = (self.reader.clone(), entry.block_num, entry.seq);
        let before = self.state.undo.insert(key.clone(), entry.clone());
        self.journal.push(Change::Undo { key, before });
        Ok(())
    }

    async fn undo_entries(&mut self, block_num: u64) -> Result<Vec<UndoEntry>, IndexerError> {
        Ok(self
            .state
            .undo
            .iter()
            .filter(|((r, b, _), _)| *r == self.reader && *b == block_num)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn undo_blocks_from(&mut self, from_block: u64) -> Result<Vec<u64>, IndexerError> {
        let mut blocks: Vec<u64> = self
            .state
            .undo
            .keys()
            .filter(|(r, b, _)| *r == self.reader && *b >= from_block)
            .map(|(_, b, _)| *b)
            .collect();
        blocks.dedup();
        blocks.reverse();
        Ok(blocks)
    }

    async fn take_undo(&mut self, block_num: u64) -> Result<Vec<UndoEntry>, IndexerError> {
        let keys: Vec<UndoKey> = self
            .state
            .undo
            .keys()
            .filter(|(r, b, _)| *r == self.reader && *b == block_num)
            .cloned()
            .collect();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.state.undo.remove(&key) {
                entries.push(entry.clone());
                self.journal.push(Change::Undo {
                    key,
                    before: Some(entry),
                });
            }
        }
        Ok(entries)
    }

    async fn prune_undo(&mut self, up_to: u64) -> Result<u64, IndexerError> {
        let blocks: Vec<u64> = self
            .undo_blocks_from(0)
            .await?
            .into_iter()
            .filter(|b| *b <= up_to)
            .collect();
        let mut removed = 0;
        for block in blocks {
            removed += self.take_undo(block).await?.len() as u64;
        }
        Ok(removed)
    }

    async fn clear_undo(&mut self) -> Result<(), IndexerError> {
        self.prune_undo(u64::MAX).await.map(|_| ())
    }

    async fn load_checkpoint(&mut self) -> Result<Option<ReaderCheckpoint>, IndexerError> {
        Ok(self.state.checkpoints.get(&self.reader).cloned())
    }

    async fn save_checkpoint(&mut self, checkpoint: &ReaderCheckpoint) -> Result<(), IndexerError> {
        let reader = checkpoint.reader.clone();
        let before = self.state.checkpoints.insert(reader.clone(), checkpoint.clone());
        self.journal.push(Change::Checkpoint { reader, before });
        Ok(())
    }

    async fn delete_checkpoint(&mut self) -> Result<(), IndexerError> {
        let reader = self.reader.clone();
        let before = self.state.checkpoints.remove(&reader);
        self.journal.push(Change::Checkpoint { reader, before });
        Ok(())
    }

    async fn schema_version(&mut self, handler: &str) -> Result<Option<u32>, IndexerError> {
        let key = (self.reader.clone(), handler.to_string());
        Ok(self.state.versions.get(&key).copied())
    }

    async fn set_schema_version(&mut self, handler: &str, version: u32) -> Result<(), IndexerError> {
        let key = (self.reader.clone(), handler.to_string());
        let before = self.state.versions.insert(key.clone(), version);
        self.journal.push(Change::Version { key, before });
        Ok(())
    }

    async fn delete_schema_version(&mut self, handler: &str) -> Result<(), IndexerError> {
        let key = (self.reader.clone(), handler.to_string());
        if let Some(before) = self.state.versions.remove(&key) {
            self.journal.push(Change::Version {
                key,
                before: Some(before),
            });
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), IndexerError> {
        self.journal.clear();
        self.done = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), IndexerError> {
        self.revert();
        self.done = true;
        Ok(())
    }
}
