//! SQLite storage backend for ChainReader.
//!
//! Persists handler tables, the undo log, checkpoints and handler schema
//! versions to a single SQLite file. Every [`StoreTx`] is a real SQLite
//! transaction, so a block's rows, undo entries and checkpoint land together.
//!
//! # Usage
//! ```rust,no_run
//! use chainreader_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./reader.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{Sqlite, SqlitePoolOptions};
use sqlx::{Row, SqlitePool, Transaction};
use tracing::debug;

use chainreader_core::checkpoint::ReaderCheckpoint;
use chainreader_core::error::IndexerError;
use chainreader_core::store::{validate_table_name, Store, StoreTx, UndoEntry};

fn storage_err(e: impl ToString) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite-backed [`Store`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./reader.db"`) or a full
    /// SQLite URL (`"sqlite:./reader.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// A single connection, since every connection would otherwise see its
    /// own empty database. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create pipeline tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        // WAL: readers do not block the writer
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS reader_checkpoints (
                reader       TEXT    NOT NULL PRIMARY KEY,
                block_num    INTEGER NOT NULL,
                block_id     TEXT    NOT NULL,
                block_time   INTEGER NOT NULL,
                irreversible INTEGER NOT NULL,
                live         INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS reader_undo (
                reader       TEXT    NOT NULL,
                block_num    INTEGER NOT NULL,
                seq          INTEGER NOT NULL,
                table_name   TEXT    NOT NULL,
                row_key      TEXT    NOT NULL,
                before_value TEXT,
                PRIMARY KEY (reader, block_num, seq)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS handler_versions (
                reader   TEXT    NOT NULL,
                handler  TEXT    NOT NULL,
                version  INTEGER NOT NULL,
                PRIMARY KEY (reader, handler)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn begin(&self, reader: &str) -> Result<Box<dyn StoreTx>, IndexerError> {
        let tx = self.pool.begin().await.map_err(storage_err)?;
        Ok(Box::new(SqliteTx {
            reader: reader.to_string(),
            tx,
        }))
    }

    async fn load_checkpoint(&self, reader: &str) -> Result<Option<ReaderCheckpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT reader, block_num, block_id, block_time, irreversible, live, updated_at
             FROM reader_checkpoints WHERE reader = ?",
        )
        .bind(reader)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| checkpoint_from_row(&r)))
    }
}

fn checkpoint_from_row(r: &sqlx::sqlite::SqliteRow) -> ReaderCheckpoint {
    ReaderCheckpoint {
        reader: r.get("reader"),
        block_num: r.get::<i64, _>("block_num") as u64,
        block_id: r.get("block_id"),
        block_time: r.get("block_time"),
        irreversible: r.get::<i64, _>("irreversible") as u64,
        live: r.get::<i64, _>("live") != 0,
        updated_at: r.get("updated_at"),
    }
}

/// One open SQLite transaction. sqlx rolls it back when dropped uncommitted.
struct SqliteTx {
    reader: String,
    tx: Transaction<'static, Sqlite>,
}

fn parse_value(raw: &str) -> Result<Value, IndexerError> {
    serde_json::from_str(raw).map_err(storage_err)
}

#[async_trait]
impl StoreTx for SqliteTx {
    fn reader(&self) -> &str {
        &self.reader
    }

    // ─── Handler tables ─────────────────────────────────────────────────────────

    async fn create_table(&mut self, table: &str) -> Result<bool, IndexerError> {
        validate_table_name(table)?;
        let exists = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage_err)?
            .is_some();
        if exists {
            return Ok(false);
        }

        sqlx::query(&format!(
            "CREATE TABLE {table} (
                reader  TEXT NOT NULL,
                row_key TEXT NOT NULL,
                value   TEXT NOT NULL,
                PRIMARY KEY (reader, row_key)
            );"
        ))
        .execute(&mut *self.tx)
        .await
        .map_err(storage_err)?;

        debug!(reader = %self.reader, table, "handler table created");
        Ok(true)
    }

    async fn get(&mut self, table: &str, row_key: &str) -> Result<Option<Value>, IndexerError> {
        validate_table_name(table)?;
        let row = sqlx::query(&format!("SELECT value FROM {table} WHERE reader = ? AND row_key = ?"))
            .bind(&self.reader)
            .bind(row_key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage_err)?;

        row.map(|r| parse_value(&r.get::<String, _>("value"))).transpose()
    }

    async fn put(&mut self, table: &str, row_key: &str, value: &Value) -> Result<(), IndexerError> {
        validate_table_name(table)?;
        let json = serde_json::to_string(value).map_err(storage_err)?;
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {table} (reader, row_key, value) VALUES (?, ?, ?)"
        ))
        .bind(&self.reader)
        .bind(row_key)
        .bind(&json)
        .execute(&mut *self.tx)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn remove(&mut self, table: &str, row_key: &str) -> Result<bool, IndexerError> {
        validate_table_name(table)?;
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE reader = ? AND row_key = ?"))
            .bind(&self.reader)
            .bind(row_key)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn scan(&mut self, table: &str) -> Result<Vec<(String, Value)>, IndexerError> {
        validate_table_name(table)?;
        let rows = sqlx::query(&format!(
            "SELECT row_key, value FROM {table} WHERE reader = ? ORDER BY row_key"
        ))
        .bind(&self.reader)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("row_key");
            let value = parse_value(&row.get::<String, _>("value"))?;
            out.push((key, value));
        }
        Ok(out)
    }

    async fn clear_table(&mut self, table: &str) -> Result<u64, IndexerError> {
        validate_table_name(table)?;
        let exists = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage_err)?;
        if exists.is_none() {
            return Ok(0);
        }
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE reader = ?"))
            .bind(&self.reader)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    // ─── Undo log ───────────────────────────────────────────────────────────────

    async fn append_undo(&mut self, entry: &UndoEntry) -> Result<(), IndexerError> {
        let before = entry
            .before
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(storage_err)?;

        sqlx::query(
            "INSERT OR REPLACE INTO reader_undo
             (reader, block_num, seq, table_name, row_key, before_value)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.reader)
        .bind(entry.block_num as i64)
        .bind(entry.seq as i64)
        .bind(&entry.table)
        .bind(&entry.row_key)
        .bind(before)
        .execute(&mut *self.tx)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn undo_blocks_from(&mut self, from_block: u64) -> Result<Vec<u64>, IndexerError> {
        let rows = sqlx::query(
            "SELECT DISTINCT block_num FROM reader_undo
             WHERE reader = ? AND block_num >= ? ORDER BY block_num DESC",
        )
        .bind(&self.reader)
        .bind(from_block as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .iter()
            .map(|r| r.get::<i64, _>("block_num") as u64)
            .collect())
    }

    async fn undo_entries(&mut self, block_num: u64) -> Result<Vec<UndoEntry>, IndexerError> {
        let rows = sqlx::query(
            "SELECT block_num, seq, table_name, row_key, before_value FROM reader_undo
             WHERE reader = ? AND block_num = ? ORDER BY seq",
        )
        .bind(&self.reader)
        .bind(block_num as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let before: Option<String> = row.get("before_value");
            entries.push(UndoEntry {
                block_num: row.get::<i64, _>("block_num") as u64,
                seq: row.get::<i64, _>("seq") as u32,
                table: row.get("table_name"),
                row_key: row.get("row_key"),
                before: before.as_deref().map(parse_value).transpose()?,
            });
        }
        Ok(entries)
    }

    async fn take_undo(&mut self, block_num: u64) -> Result<Vec<UndoEntry>, IndexerError> {
        let entries = self.undo_entries(block_num).await?;
        sqlx::query("DELETE FROM reader_undo WHERE reader = ? AND block_num = ?")
            .bind(&self.reader)
            .bind(block_num as i64)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_err)?;
        Ok(entries)
    }

    async fn prune_undo(&mut self, up_to: u64) -> Result<u64, IndexerError> {
        let result = sqlx::query("DELETE FROM reader_undo WHERE reader = ? AND block_num <= ?")
            .bind(&self.reader)
            .bind(up_to as i64)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn clear_undo(&mut self) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM reader_undo WHERE reader = ?")
            .bind(&self.reader)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // ─── Checkpoint & schema versions ───────────────────────────────────────────

    async fn load_checkpoint(&mut self) -> Result<Option<ReaderCheckpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT reader, block_num, block_id, block_time, irreversible, live, updated_at
             FROM reader_checkpoints WHERE reader = ?",
        )
        .bind(&self.reader)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| checkpoint_from_row(&r)))
    }

    async fn save_checkpoint(&mut self, checkpoint: &ReaderCheckpoint) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO reader_checkpoints
             (reader, block_num, block_id, block_time, irreversible, live, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.reader)
        .bind(checkpoint.block_num as i64)
        .bind(&checkpoint.block_id)
        .bind(checkpoint.block_time)
        .bind(checkpoint.irreversible as i64)
        .bind(checkpoint.live as i64)
        .bind(checkpoint.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage_err)?;

        debug!(reader = %checkpoint.reader, block = checkpoint.block_num, "checkpoint saved");
        Ok(())
    }

    async fn delete_checkpoint(&mut self) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM reader_checkpoints WHERE reader = ?")
            .bind(&self.reader)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn schema_version(&mut self, handler: &str) -> Result<Option<u32>, IndexerError> {
        let row = sqlx::query("SELECT version FROM handler_versions WHERE reader = ? AND handler = ?")
            .bind(&self.reader)
            .bind(handler)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage_err)?;

        Ok(row.map(|r| r.get::<i64, _>("version") as u32))
    }

    async fn set_schema_version(&mut self, handler: &str, version: u32) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO handler_versions (reader, handler, version) VALUES (?, ?, ?)",
        )
        .bind(&self.reader)
        .bind(handler)
        .bind(version as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn delete_schema_version(&mut self, handler: &str) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM handler_versions WHERE reader = ? AND handler = ?")
            .bind(&self.reader)
            .bind(handler)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // ─── Completion ─────────────────────────────────────────────────────────────

    async fn commit(self: Box<Self>) -> Result<(), IndexerError> {
        self.tx.commit().await.map_err(storage_err)
    }

    async fn rollback(self: Box<Self>) -> Result<(), IndexerError> {
        self.tx.rollback().await.map_err(storage_err)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chainreader_core::types::BlockHeader;
    use chainreader_core::writer::{revert_block, BlockWriter};
    use serde_json::json;

    fn header(number: u64) -> BlockHeader {
        BlockHeader {
            number,
            id: format!("{number:064x}"),
            timestamp: 1_700_000_000 + number as i64,
            irreversible: false,
            head: number + 10,
            last_irreversible: number.saturating_sub(5),
        }
    }

    // ── Checkpoints ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn checkpoint_roundtrip_and_upsert() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.load_checkpoint("main").await.unwrap().is_none());

        let cp = ReaderCheckpoint::genesis("main").advance(&header(100), false);
        let mut tx = store.begin("main").await.unwrap();
        tx.save_checkpoint(&cp).await.unwrap();
        tx.commit().await.unwrap();

        let next = cp.advance(&header(101), true);
        let mut tx = store.begin("main").await.unwrap();
        tx.save_checkpoint(&next).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = store.load_checkpoint("main").await.unwrap().unwrap();
        assert_eq!(loaded, next);
        assert!(loaded.live);
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_nothing_behind() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut tx = store.begin("main").await.unwrap();
        tx.create_table("accounts").await.unwrap();
        tx.commit().await.unwrap();

        {
            let mut tx = store.begin("main").await.unwrap();
            tx.put("accounts", "alice", &json!({"balance": "1.0000 EOS"})).await.unwrap();
            tx.save_checkpoint(&ReaderCheckpoint::genesis("main")).await.unwrap();
        }

        let mut tx = store.begin("main").await.unwrap();
        assert!(tx.get("accounts", "alice").await.unwrap().is_none());
        assert!(tx.load_checkpoint().await.unwrap().is_none());
        tx.rollback().await.unwrap();
    }

    // ── Handler tables ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn rows_are_scoped_by_reader() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut tx = store.begin("r1").await.unwrap();
        assert!(tx.create_table("accounts").await.unwrap());
        assert!(!tx.create_table("accounts").await.unwrap());
        tx.put("accounts", "b", &json!(2)).await.unwrap();
        tx.put("accounts", "a", &json!(1)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin("r2").await.unwrap();
        assert!(tx.scan("accounts").await.unwrap().is_empty());
        tx.put("accounts", "a", &json!(9)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin("r1").await.unwrap();
        assert_eq!(
            tx.scan("accounts").await.unwrap(),
            vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
        );
        assert!(tx.remove("accounts", "a").await.unwrap());
        assert!(!tx.remove("accounts", "a").await.unwrap());
        assert_eq!(tx.clear_table("accounts").await.unwrap(), 1);
        tx.commit().await.unwrap();

        let mut tx = store.begin("r2").await.unwrap();
        assert_eq!(tx.get("accounts", "a").await.unwrap(), Some(json!(9)));
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn bad_table_names_never_reach_sql() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut tx = store.begin("main").await.unwrap();
        assert!(tx.create_table("x; DROP TABLE reader_undo").await.is_err());
        assert!(tx.get("reader_checkpoints", "main").await.is_err());
    }

    // ── Undo log ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn revert_block_restores_rows() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut tx = store.begin("main").await.unwrap();
        tx.create_table("accounts").await.unwrap();
        tx.put("accounts", "alice", &json!({"balance": 10})).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin("main").await.unwrap();
        let mut writer = BlockWriter::new(tx.as_mut(), 101, true);
        writer.upsert("accounts", "alice", json!({"balance": 4})).await.unwrap();
        writer.upsert("accounts", "bob", json!({"balance": 6})).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin("main").await.unwrap();
        assert_eq!(tx.undo_blocks_from(100).await.unwrap(), vec![101]);
        assert_eq!(revert_block(tx.as_mut(), 101).await.unwrap().entries, 2);
        tx.commit().await.unwrap();

        let mut tx = store.begin("main").await.unwrap();
        assert_eq!(
            tx.scan("accounts").await.unwrap(),
            vec![("alice".to_string(), json!({"balance": 10}))]
        );
        assert!(tx.undo_blocks_from(0).await.unwrap().is_empty());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn undo_blocks_descend_and_prune() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut tx = store.begin("main").await.unwrap();
        for block in [100u64, 101, 102] {
            for seq in 0..2 {
                tx.append_undo(&UndoEntry {
                    block_num: block,
                    seq,
                    table: "accounts".into(),
                    row_key: "k".into(),
                    before: Some(json!(seq)),
                })
                .await
                .unwrap();
            }
        }
        assert_eq!(tx.undo_blocks_from(101).await.unwrap(), vec![102, 101]);
        assert_eq!(tx.prune_undo(101).await.unwrap(), 4);

        let cp = ReaderCheckpoint::genesis("main");
        tx.append_undo(&UndoEntry::checkpoint(102, &cp).unwrap()).await.unwrap();
        // reading leaves the entries in place
        assert_eq!(tx.undo_entries(102).await.unwrap().len(), 3);
        assert_eq!(tx.undo_entries(102).await.unwrap().len(), 3);

        let taken = tx.take_undo(102).await.unwrap();
        assert_eq!(taken.len(), 3);
        assert_eq!(taken[2].checkpoint_before().unwrap(), Some(cp));
        let taken = &taken[..2];
        assert_eq!(taken.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(taken[1].before, Some(json!(1)));
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn schema_versions_per_reader() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut tx = store.begin("r1").await.unwrap();
        assert_eq!(tx.schema_version("token").await.unwrap(), None);
        tx.set_schema_version("token", 2).await.unwrap();
        assert_eq!(tx.schema_version("token").await.unwrap(), Some(2));
        tx.commit().await.unwrap();

        let mut tx = store.begin("r2").await.unwrap();
        assert_eq!(tx.schema_version("token").await.unwrap(), None);
        tx.commit().await.unwrap();

        let mut tx = store.begin("r1").await.unwrap();
        tx.delete_schema_version("token").await.unwrap();
        assert_eq!(tx.schema_version("token").await.unwrap(), None);
        assert_eq!(tx.clear_table("never_created").await.unwrap(), 0);
        tx.commit().await.unwrap();
    }
}
