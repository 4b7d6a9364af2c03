//! chainreader-storage — pluggable storage backends for ChainReader.
//!
//! Backends:
//! - [`MemoryStore`] — in-memory (dev/testing, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)
//!
//! Both implement [`chainreader_core::store::Store`]; the reader never knows
//! which one it is writing to.

#[cfg(feature = "memory")]
pub use chainreader_core::memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
