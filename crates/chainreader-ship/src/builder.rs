//! Fluent builder API for creating readers.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainreader_core::MemoryStore;
//! use chainreader_ship::ReaderBuilder;
//!
//! let (reader, handle) = ReaderBuilder::new()
//!     .name("tokens")
//!     .endpoint("ws://127.0.0.1:8080")
//!     .start_block(1_000)
//!     .live_threshold(3)
//!     .store(Arc::new(MemoryStore::new()))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

use chainreader_core::config::{ReaderConfig, RetryConfig};
use chainreader_core::error::IndexerError;
use chainreader_core::handler::{ContractHandler, EmptySnapshot, HandlerSet, TableSnapshot};
use chainreader_core::store::Store;

use crate::abi::Abi;
use crate::decode::AbiRegistry;
use crate::reader::{Reader, ReaderHandle};
use crate::source::{BlockSource, WsBlockSource};

/// Fluent builder for a [`Reader`].
#[derive(Default)]
pub struct ReaderBuilder {
    config: ReaderConfig,
    store: Option<Arc<dyn Store>>,
    source: Option<Arc<dyn BlockSource>>,
    handlers: Vec<Arc<dyn ContractHandler>>,
    abis: AbiRegistry,
    snapshot: Option<Arc<dyn TableSnapshot>>,
}

impl ReaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ReaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the reader name (checkpoint key, row scope).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the block-stream endpoint.
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.endpoint = url.into();
        self
    }

    /// Set the first block to index when no checkpoint exists.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    /// Stop after this block is committed.
    pub fn end_block(mut self, block: u64) -> Self {
        self.config.end_block = Some(block);
        self
    }

    /// Set how many blocks may be requested ahead of processing.
    pub fn prefetch(mut self, blocks: usize) -> Self {
        self.config.prefetch = blocks;
        self
    }

    pub fn decode_workers(mut self, workers: usize) -> Self {
        self.config.decode_workers = workers;
        self
    }

    /// Blocks behind head at which the reader counts as live.
    pub fn live_threshold(mut self, blocks: u64) -> Self {
        self.config.live_threshold = blocks;
        self
    }

    pub fn stall_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stall_timeout_secs = secs;
        self
    }

    pub fn watchdog_interval_secs(mut self, secs: u64) -> Self {
        self.config.watchdog_interval_secs = secs;
        self
    }

    /// Delete all handler data on start and re-index.
    pub fn resync(mut self, resync: bool) -> Self {
        self.config.resync = resync;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the block source (defaults to a WebSocket source on `endpoint`).
    pub fn source(mut self, source: Arc<dyn BlockSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Add a contract handler. Handlers are prepared in the order added.
    pub fn handler(mut self, handler: Arc<dyn ContractHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Register the ABI used to decode `contract`'s tables and actions.
    pub fn abi(mut self, contract: impl Into<String>, abi: &Abi) -> Self {
        self.abis.insert(contract, abi);
        self
    }

    /// Snapshot source for handler backfill (defaults to empty).
    pub fn snapshot(mut self, snapshot: Arc<dyn TableSnapshot>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Build the `ReaderConfig` only.
    pub fn build_config(self) -> ReaderConfig {
        self.config
    }

    /// Validate and assemble the reader.
    pub fn build(self) -> Result<(Reader, ReaderHandle), IndexerError> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| IndexerError::Config("a store is required".into()))?;
        let source = self
            .source
            .unwrap_or_else(|| Arc::new(WsBlockSource::new(self.config.endpoint.clone())));
        let snapshot = self.snapshot.unwrap_or_else(|| Arc::new(EmptySnapshot));
        Ok(Reader::new(
            self.config,
            store,
            source,
            HandlerSet::new(self.handlers),
            self.abis,
            snapshot,
        ))
    }
}
