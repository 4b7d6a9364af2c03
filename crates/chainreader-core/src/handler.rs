//! Contract handler trait + the lifecycle driver for a static handler set.
//!
//! One handler per indexed on-chain application. The reader drives every
//! handler through `setup → upgrade → init → register`, each step in its own
//! transaction, and tears registrations down in reverse order on shutdown.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::checkpoint::ReaderCheckpoint;
use crate::error::IndexerError;
use crate::processor::{DataProcessor, Registration};
use crate::store::{Store, StoreTx};
use crate::types::TableDelta;
use crate::writer::BlockWriter;

/// Current rows of a contract table, read from the node for backfill.
#[async_trait]
pub trait TableSnapshot: Send + Sync {
    async fn table_rows(&self, contract: &str, table: &str) -> Result<Vec<TableDelta>, IndexerError>;
}

/// Snapshot source with no rows; used when a reader starts at genesis.
pub struct EmptySnapshot;

#[async_trait]
impl TableSnapshot for EmptySnapshot {
    async fn table_rows(&self, _contract: &str, _table: &str) -> Result<Vec<TableDelta>, IndexerError> {
        Ok(vec![])
    }
}

/// A pluggable indexing unit for one on-chain application.
#[async_trait]
pub trait ContractHandler: Send + Sync {
    /// Unique handler name (used for schema versions and logs).
    fn name(&self) -> &str;

    /// Schema version of the running code.
    fn version(&self) -> u32;

    /// Idempotently create the handler's tables.
    /// Returns `true` if the schema did not exist for this reader before.
    async fn setup(&self, conn: &mut dyn StoreTx) -> Result<bool, IndexerError>;

    /// Migrate from `from_version` to [`ContractHandler::version`].
    async fn upgrade(&self, conn: &mut dyn StoreTx, from_version: u32) -> Result<(), IndexerError>;

    /// One-time backfill from the node's current table snapshot.
    async fn init(&self, writer: &mut BlockWriter<'_>, snapshot: &dyn TableSnapshot) -> Result<(), IndexerError>;

    /// Register this handler's processors.
    fn register(&self, processor: &mut DataProcessor) -> Vec<Registration>;

    /// Purge this handler's rows for the reader.
    async fn delete_db(&self, conn: &mut dyn StoreTx) -> Result<(), IndexerError>;

    /// Called after a fork rollback so owned caches can be reloaded.
    async fn on_rollback(&self, _conn: &mut dyn StoreTx) -> Result<(), IndexerError> {
        Ok(())
    }
}

/// The static set of handlers a reader runs, in registration order.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: Vec<Arc<dyn ContractHandler>>,
}

impl HandlerSet {
    pub fn new(handlers: Vec<Arc<dyn ContractHandler>>) -> Self {
        Self { handlers }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ContractHandler>> {
        self.handlers.iter()
    }

    /// Wipe every handler's rows plus the reader's checkpoint and undo log.
    pub async fn delete_all(&self, store: &dyn Store, reader: &str) -> Result<(), IndexerError> {
        let mut tx = store.begin(reader).await?;
        for handler in &self.handlers {
            warn!(reader, handler = handler.name(), "deleting handler data for resync");
            handler.delete_db(tx.as_mut()).await?;
            tx.delete_schema_version(handler.name()).await?;
        }
        tx.clear_undo().await?;
        tx.delete_checkpoint().await?;
        tx.commit().await
    }

    /// Run `setup → upgrade → init` for every handler, then register them all.
    ///
    /// `checkpoint` is the block backfill rows are attributed to.
    pub async fn prepare(
        &self,
        store: &dyn Store,
        checkpoint: &ReaderCheckpoint,
        snapshot: &dyn TableSnapshot,
        processor: &mut DataProcessor,
    ) -> Result<Vec<Registration>, IndexerError> {
        let reader = checkpoint.reader.as_str();
        for handler in &self.handlers {
            let name = handler.name();
            let mut tx = store.begin(reader).await?;

            let created = handler.setup(tx.as_mut()).await?;
            let target = handler.version();
            match tx.schema_version(name).await? {
                Some(stored) if stored < target => {
                    info!(reader, handler = name, from = stored, to = target, "upgrading handler schema");
                    handler.upgrade(tx.as_mut(), stored).await?;
                    tx.set_schema_version(name, target).await?;
                }
                Some(stored) if stored > target => {
                    return Err(IndexerError::Config(format!(
                        "handler '{name}' stored schema v{stored} is newer than code v{target}"
                    )));
                }
                Some(_) => {}
                None => tx.set_schema_version(name, target).await?,
            }

            if created {
                info!(reader, handler = name, block = checkpoint.block_num, "backfilling handler from snapshot");
                let mut writer = BlockWriter::new(tx.as_mut(), checkpoint.block_num, false);
                handler.init(&mut writer, snapshot).await?;
                info!(reader, handler = name, rows = writer.writes(), "backfill complete");
            }
            tx.commit().await?;
        }

        let mut registrations = Vec::new();
        for handler in &self.handlers {
            registrations.extend(handler.register(processor));
        }
        info!(reader = %checkpoint.reader, processors = processor.len(), "handlers registered");
        Ok(registrations)
    }

    /// Let every handler refresh caches after a rollback.
    pub async fn after_rollback(&self, store: &dyn Store, reader: &str) -> Result<(), IndexerError> {
        let mut tx = store.begin(reader).await?;
        for handler in &self.handlers {
            handler.on_rollback(tx.as_mut()).await?;
        }
        tx.commit().await
    }
}

/// Close registrations newest first.
pub fn teardown(processor: &mut DataProcessor, registrations: Vec<Registration>) {
    for registration in registrations.into_iter().rev() {
        registration.close(processor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::processor::Processor;
    use crate::types::{BlockHeader, Record};
    use serde_json::json;
    use std::sync::Mutex;

    struct Noop;

    #[async_trait]
    impl Processor for Noop {
        async fn process(&self, _w: &mut BlockWriter<'_>, _b: &BlockHeader, _r: &Record) -> Result<(), IndexerError> {
            Ok(())
        }
    }

    /// Records the lifecycle calls it receives.
    struct Probe {
        name: String,
        version: u32,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Probe {
        fn new(name: &str, version: u32, calls: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.into(),
                version,
                calls: Arc::clone(calls),
            }
        }

        fn log(&self, what: String) {
            self.calls.lock().unwrap().push(format!("{}:{what}", self.name));
        }
    }

    #[async_trait]
    impl ContractHandler for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        fn version(&self) -> u32 {
            self.version
        }

        async fn setup(&self, conn: &mut dyn StoreTx) -> Result<bool, IndexerError> {
            self.log("setup".into());
            conn.create_table(&self.name).await?;
            Ok(conn.schema_version(&self.name).await?.is_none())
        }

        async fn upgrade(&self, _conn: &mut dyn StoreTx, from: u32) -> Result<(), IndexerError> {
            self.log(format!("upgrade{from}"));
            Ok(())
        }

        async fn init(&self, writer: &mut BlockWriter<'_>, _s: &dyn TableSnapshot) -> Result<(), IndexerError> {
            self.log("init".into());
            writer.upsert(&self.name, "seed", json!(1)).await
        }

        fn register(&self, processor: &mut DataProcessor) -> Vec<Registration> {
            self.log("register".into());
            vec![processor.on_table(self.name.clone(), "c", "t", 1, Arc::new(Noop))]
        }

        async fn delete_db(&self, conn: &mut dyn StoreTx) -> Result<(), IndexerError> {
            self.log("delete".into());
            conn.clear_table(&self.name).await.map(|_| ())
        }
    }

    #[tokio::test]
    async fn lifecycle_order_and_one_time_init() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let store = MemoryStore::new();
        let set = HandlerSet::new(vec![
            Arc::new(Probe::new("alpha", 1, &calls)),
            Arc::new(Probe::new("beta", 1, &calls)),
        ]);
        let cp = ReaderCheckpoint::genesis("r");

        let mut dp = DataProcessor::new();
        let regs = set.prepare(&store, &cp, &EmptySnapshot, &mut dp).await.unwrap();
        assert_eq!(regs.len(), 2);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["alpha:setup", "alpha:init", "beta:setup", "beta:init", "alpha:register", "beta:register"]
        );
        assert_eq!(store.rows("r", "alpha").await.len(), 1);
        teardown(&mut dp, regs);
        assert!(dp.is_empty());

        // second start: no init
        calls.lock().unwrap().clear();
        let mut dp = DataProcessor::new();
        let regs = set.prepare(&store, &cp, &EmptySnapshot, &mut dp).await.unwrap();
        assert!(!calls.lock().unwrap().iter().any(|c| c.ends_with("init")));
        teardown(&mut dp, regs);
    }

    #[tokio::test]
    async fn upgrade_runs_when_stored_version_is_behind() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let store = MemoryStore::new();
        let cp = ReaderCheckpoint::genesis("r");

        let v1 = HandlerSet::new(vec![Arc::new(Probe::new("alpha", 1, &calls))]);
        let mut dp = DataProcessor::new();
        let regs = v1.prepare(&store, &cp, &EmptySnapshot, &mut dp).await.unwrap();
        teardown(&mut dp, regs);

        calls.lock().unwrap().clear();
        let v3 = HandlerSet::new(vec![Arc::new(Probe::new("alpha", 3, &calls))]);
        let regs = v3.prepare(&store, &cp, &EmptySnapshot, &mut dp).await.unwrap();
        assert!(calls.lock().unwrap().contains(&"alpha:upgrade1".to_string()));
        teardown(&mut dp, regs);

        // and never twice
        calls.lock().unwrap().clear();
        let regs = v3.prepare(&store, &cp, &EmptySnapshot, &mut dp).await.unwrap();
        assert!(!calls.lock().unwrap().iter().any(|c| c.contains("upgrade")));
        teardown(&mut dp, regs);
    }

    #[tokio::test]
    async fn newer_stored_schema_is_refused() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let store = MemoryStore::new();
        let cp = ReaderCheckpoint::genesis("r");
        let mut dp = DataProcessor::new();

        let v2 = HandlerSet::new(vec![Arc::new(Probe::new("alpha", 2, &calls))]);
        let regs = v2.prepare(&store, &cp, &EmptySnapshot, &mut dp).await.unwrap();
        teardown(&mut dp, regs);

        let v1 = HandlerSet::new(vec![Arc::new(Probe::new("alpha", 1, &calls))]);
        let err = v1.prepare(&store, &cp, &EmptySnapshot, &mut dp).await.unwrap_err();
        assert!(matches!(err, IndexerError::Config(_)));
    }

    #[tokio::test]
    async fn delete_all_resets_reader() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let store = MemoryStore::new();
        let set = HandlerSet::new(vec![Arc::new(Probe::new("alpha", 1, &calls))]);
        let cp = ReaderCheckpoint::genesis("r");
        let mut dp = DataProcessor::new();
        let regs = set.prepare(&store, &cp, &EmptySnapshot, &mut dp).await.unwrap();
        teardown(&mut dp, regs);

        let mut tx = store.begin("r").await.unwrap();
        tx.save_checkpoint(&cp).await.unwrap();
        tx.commit().await.unwrap();

        set.delete_all(&store, "r").await.unwrap();
        assert!(store.rows("r", "alpha").await.is_empty());
        assert!(store.load_checkpoint("r").await.unwrap().is_none());

        // the next start backfills again
        calls.lock().unwrap().clear();
        let regs = set.prepare(&store, &cp, &EmptySnapshot, &mut dp).await.unwrap();
        assert!(calls.lock().unwrap().contains(&"alpha:init".to_string()));
        teardown(&mut dp, regs);
    }

    #[tokio::test]
    async fn delete_all_before_first_start_is_harmless() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let store = MemoryStore::new();
        let set = HandlerSet::new(vec![Arc::new(Probe::new("alpha", 1, &calls))]);
        set.delete_all(&store, "r").await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["alpha:delete"]);
    }
}
