//! chainreader-core — foundation for the fork-aware block ingestion pipeline.
//!
//! # Architecture
//!
//! ```text
//! Reader (chainreader-ship)
//!   ├── HandlerSet      (setup → upgrade → init → register)
//!   ├── DataProcessor   (priority-ordered fan-out per block)
//!   ├── BlockWriter     (handler writes + undo capture)
//!   ├── ReaderCheckpoint (resume position, last write of every block)
//!   └── Store / StoreTx (memory / SQLite)
//!
//! alongside: JobQueue (periodic maintenance), Watchdog (stall → exit)
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod handler;
pub mod memory;
pub mod processor;
pub mod progress;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod watchdog;
pub mod writer;

pub use checkpoint::ReaderCheckpoint;
pub use config::{ReaderConfig, RetryConfig};
pub use error::IndexerError;
pub use handler::{teardown, ContractHandler, EmptySnapshot, HandlerSet, TableSnapshot};
pub use memory::MemoryStore;
pub use processor::{DataProcessor, Processor, Registration};
pub use progress::{estimate_catch_up_secs, SpeedMeter, ETA_MAX_DEPTH};
pub use scheduler::{wait_for_stop, JobPriority, JobQueue};
pub use store::{Store, StoreTx, UndoEntry};
pub use types::{
    ActionTrace, BlockHeader, BlockPosition, DecodedBlock, ReaderState, ReaderStatus, Record, RecordKey, StreamItem, TableDelta,
};
pub use watchdog::{ExitHook, StallDetector, Watchdog};
pub use writer::{revert_block, row_key, BlockWriter, RevertedBlock};
