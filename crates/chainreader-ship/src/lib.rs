//! chainreader-ship — block stream client, decode queue and the reader
//! orchestrator.
//!
//! ```text
//! BlockSource ─► StreamClient ─► DecodeQueue ─► Reader ─► Store
//!  (ws/script)   (prefetch,      (ABI decode,    (per-block tx,
//!                 forks, retry)   in order)       undo, checkpoint)
//! ```

pub mod abi;
pub mod builder;
pub mod client;
pub mod decode;
pub mod envelope;
pub mod reader;
pub mod source;
pub mod tracker;

pub use abi::{Abi, AbiError, CompiledAbi};
pub use builder::ReaderBuilder;
pub use client::{BlockReceiver, StreamClient};
pub use decode::{AbiRegistry, DecodeQueue};
pub use envelope::{ClientMessage, RawBlock, RawDelta, RawTrace, SourceMessage};
pub use reader::{Reader, ReaderHandle};
pub use source::{BlockRequest, BlockSource, ScriptedSource, SourceStream, WsBlockSource};
