//! Error types for the chainreader pipeline.

use thiserror::Error;

/// Errors that can occur during ingestion.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Connection dropped or node unavailable. Retried by the stream client.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Stream order violation: {0}")]
    StreamOrder(String),

    #[error("Decode error at block {block}: {reason}")]
    Decode { block: u64, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Handler error in '{handler}': {reason}")]
    Handler { handler: String, reason: String },

    /// The chain reported a state change a handler's model declares impossible.
    #[error("Invariant violated in '{handler}': {reason}")]
    Invariant { handler: String, reason: String },

    #[error("Fork at block {fork_block} is at or below irreversible block {irreversible}")]
    ForkBeyondIrreversible { fork_block: u64, irreversible: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Reader aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the error is worth retrying at the transport layer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Shorthand for a handler error.
    pub fn handler(handler: impl Into<String>, reason: impl ToString) -> Self {
        Self::Handler {
            handler: handler.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for an invariant violation.
    pub fn invariant(handler: impl Into<String>, reason: impl ToString) -> Self {
        Self::Invariant {
            handler: handler.into(),
            reason: reason.to_string(),
        }
    }
}
