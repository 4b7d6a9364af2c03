//! Data processor — priority-ordered fan-out of a block's records.
//!
//! Processors register against a [`RecordKey`] with a numeric priority.
//! For one block, every matching processor runs once per matching record,
//! ordered globally by ascending priority (ties by registration order), not
//! grouped by key. Handlers rely on this: a config table processor at a low
//! priority lands its write before a dependent action processor runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::IndexerError;
use crate::types::{BlockHeader, Record, RecordKey};
use crate::writer::BlockWriter;

/// A callback invoked for matching records inside the block transaction.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Handle one record. Writes go through `writer`; returning an error
    /// aborts the whole block.
    async fn process(
        &self,
        writer: &mut BlockWriter<'_>,
        block: &BlockHeader,
        record: &Record,
    ) -> Result<(), IndexerError>;
}

struct Entry {
    id: u64,
    key: RecordKey,
    priority: i32,
    owner: String,
    processor: Arc<dyn Processor>,
}

/// Token returned by [`DataProcessor::register`]; closing it unregisters.
#[must_use = "dropping a Registration leaves the processor registered with no way to remove it"]
#[derive(Debug, PartialEq, Eq)]
pub struct Registration {
    /// The [`DataProcessor`] that issued it.
    registry: u64,
    id: u64,
    key: RecordKey,
    owner: String,
}

impl Registration {
    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Remove the processor. Returns `false` if it was already gone, or if
    /// `processor` is not the one that issued this token.
    pub fn close(self, processor: &mut DataProcessor) -> bool {
        if self.registry != processor.registry {
            debug!(owner = %self.owner, key = %self.key, "registration closed against another processor, ignored");
            return false;
        }
        processor.unregister(self.id)
    }
}

static NEXT_REGISTRY: AtomicU64 = AtomicU64::new(0);

/// Registry of processors keyed by (contract, table) or (contract, action).
pub struct DataProcessor {
    registry: u64,
    /// Kept sorted by (priority, id).
    entries: Vec<Entry>,
    next_id: u64,
}

impl Default for DataProcessor {
    fn default() -> Self {
        Self {
            registry: NEXT_REGISTRY.fetch_add(1, Ordering::Relaxed),
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

impl DataProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` for `key`. Lower priorities run first.
    pub fn register(
        &mut self,
        owner: impl Into<String>,
        key: RecordKey,
        priority: i32,
        processor: Arc<dyn Processor>,
    ) -> Registration {
        let id = self.next_id;
        self.next_id += 1;
        let owner = owner.into();
        let pos = self
            .entries
            .partition_point(|e| (e.priority, e.id) < (priority, id));
        debug!(owner = %owner, key = %key, priority, "processor registered");
        self.entries.insert(
            pos,
            Entry {
                id,
                key: key.clone(),
                priority,
                owner: owner.clone(),
                processor,
            },
        );
        Registration {
            registry: self.registry,
            id,
            key,
            owner,
        }
    }

    /// Shorthand for a (contract, table) registration.
    pub fn on_table(
        &mut self,
        owner: impl Into<String>,
        contract: &str,
        table: &str,
        priority: i32,
        processor: Arc<dyn Processor>,
    ) -> Registration {
        self.register(owner, RecordKey::table(contract, table), priority, processor)
    }

    /// Shorthand for a (contract, action) registration.
    pub fn on_action(
        &mut self,
        owner: impl Into<String>,
        contract: &str,
        action: &str,
        priority: i32,
        processor: Arc<dyn Processor>,
    ) -> Registration {
        self.register(owner, RecordKey::action(contract, action), priority, processor)
    }

    fn unregister(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|e| e.id == id) {
            Some(pos) => {
                let entry = self.entries.remove(pos);
                debug!(owner = %entry.owner, key = %entry.key, "processor unregistered");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(owner, key, priority)` of every registration, in dispatch order.
    pub fn registrations(&self) -> Vec<(&str, &RecordKey, i32)> {
        self.entries
            .iter()
            .map(|e| (e.owner.as_str(), &e.key, e.priority))
            .collect()
    }

    /// Run every matching processor over `records`.
    ///
    /// Returns the number of processor invocations.
    pub async fn dispatch(
        &self,
        writer: &mut BlockWriter<'_>,
        block: &BlockHeader,
        records: &[Record],
    ) -> Result<usize, IndexerError> {
        let mut by_key: HashMap<RecordKey, Vec<&Record>> = HashMap::new();
        for record in records {
            by_key.entry(record.key()).or_default().push(record);
        }

        let mut calls = 0;
        for entry in &self.entries {
            let Some(matching) = by_key.get(&entry.key) else {
                continue;
            };
            for record in matching {
                if let Err(e) = entry.processor.process(writer, block, record).await {
                    error!(
                        owner = %entry.owner,
                        key = %entry.key,
                        block = block.number,
                        error = %e,
                        "processor failed"
                    );
                    return Err(e);
                }
                calls += 1;
            }
        }
        Ok(calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::Store;
    use crate::types::{ActionTrace, TableDelta};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Processor for Recorder {
        async fn process(
            &self,
            _writer: &mut BlockWriter<'_>,
            _block: &BlockHeader,
            record: &Record,
        ) -> Result<(), IndexerError> {
            let what = match record {
                Record::Delta(d) => d.primary_key.clone(),
                Record::Action(a) => a.global_sequence.to_string(),
            };
            self.log.lock().unwrap().push(format!("{}:{}", self.tag, what));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Processor for Failing {
        async fn process(
            &self,
            _writer: &mut BlockWriter<'_>,
            _block: &BlockHeader,
            _record: &Record,
        ) -> Result<(), IndexerError> {
            Err(IndexerError::handler("failing", "boom"))
        }
    }

    fn header() -> BlockHeader {
        BlockHeader {
            number: 5,
            id: "05".into(),
            timestamp: 0,
            irreversible: true,
            head: 5,
            last_irreversible: 5,
        }
    }

    fn delta(table: &str, pk: &str) -> Record {
        Record::Delta(TableDelta {
            contract: "token".into(),
            table: table.into(),
            scope: "s".into(),
            primary_key: pk.into(),
            present: true,
            value: Value::Null,
        })
    }

    fn action(name: &str, seq: u64) -> Record {
        Record::Action(ActionTrace {
            global_sequence: seq,
            contract: "token".into(),
            action: name.into(),
            data: json!({}),
            tx_id: "tx".into(),
            authorization: vec![],
        })
    }

    fn recorder(tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Processor> {
        Arc::new(Recorder { tag, log: Arc::clone(log) })
    }

    #[tokio::test]
    async fn lower_priority_runs_first_regardless_of_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dp = DataProcessor::new();
        let _late = dp.on_action("h", "token", "transfer", 20, recorder("p20", &log));
        let _early = dp.on_table("h", "token", "stat", 10, recorder("p10", &log));

        let store = MemoryStore::new();
        let mut tx = store.begin("r").await.unwrap();
        let mut writer = BlockWriter::new(tx.as_mut(), 5, false);
        let records = vec![action("transfer", 1), delta("stat", "EOS")];
        let calls = dp.dispatch(&mut writer, &header(), &records).await.unwrap();

        assert_eq!(calls, 2);
        assert_eq!(*log.lock().unwrap(), vec!["p10:EOS", "p20:1"]);
    }

    #[tokio::test]
    async fn ties_follow_registration_order_across_keys() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dp = DataProcessor::new();
        let _a = dp.on_table("h", "token", "accounts", 10, recorder("a", &log));
        let _b = dp.on_table("h", "token", "stat", 10, recorder("b", &log));
        let _c = dp.on_table("h", "token", "accounts", 5, recorder("c", &log));

        let store = MemoryStore::new();
        let mut tx = store.begin("r").await.unwrap();
        let mut writer = BlockWriter::new(tx.as_mut(), 5, false);
        let records = vec![delta("stat", "s1"), delta("accounts", "x1"), delta("accounts", "x2")];
        dp.dispatch(&mut writer, &header(), &records).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["c:x1", "c:x2", "a:x1", "a:x2", "b:s1"]
        );
    }

    #[tokio::test]
    async fn error_stops_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dp = DataProcessor::new();
        let _f = dp.on_table("h", "token", "stat", 1, Arc::new(Failing));
        let _r = dp.on_table("h", "token", "stat", 2, recorder("r", &log));

        let store = MemoryStore::new();
        let mut tx = store.begin("r").await.unwrap();
        let mut writer = BlockWriter::new(tx.as_mut(), 5, false);
        let err = dp
            .dispatch(&mut writer, &header(), &[delta("stat", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::Handler { .. }));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_unregisters() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dp = DataProcessor::new();
        let reg = dp.on_table("h", "token", "stat", 1, recorder("r", &log));
        assert_eq!(dp.len(), 1);
        assert_eq!(reg.owner(), "h");
        assert!(reg.close(&mut dp));
        assert!(dp.is_empty());

        let store = MemoryStore::new();
        let mut tx = store.begin("r").await.unwrap();
        let mut writer = BlockWriter::new(tx.as_mut(), 5, false);
        let calls = dp.dispatch(&mut writer, &header(), &[delta("stat", "x")]).await.unwrap();
        assert_eq!(calls, 0);
    }

    #[test]
    fn token_from_another_processor_removes_nothing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut first = DataProcessor::new();
        let mut second = DataProcessor::new();
        let stray = first.on_table("h", "token", "stat", 1, recorder("a", &log));
        let kept = second.on_table("h", "token", "stat", 1, recorder("b", &log));

        // both carry id 0 in their own processor
        assert!(!stray.close(&mut second));
        assert_eq!(second.len(), 1);
        assert_eq!(first.len(), 1);
        assert!(kept.close(&mut second));
        assert!(second.is_empty());
    }
}
