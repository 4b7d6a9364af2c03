//! Shared types for the ingestion pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── BlockHeader ──────────────────────────────────────────────────────────────

/// The part of a block every processor sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block number.
    pub number: u64,
    /// Block id (hash, hex).
    pub id: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
    /// `false` while the block can still be replaced by a fork.
    pub irreversible: bool,
    /// Chain head reported by the node when this block was delivered.
    pub head: u64,
    /// Last irreversible block reported by the node.
    pub last_irreversible: u64,
}

impl BlockHeader {
    /// Blocks left between this block and the node's head.
    pub fn blocks_behind_head(&self) -> u64 {
        self.head.saturating_sub(self.number)
    }
}

/// A block the reader already holds, by number and id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPosition {
    pub block_num: u64,
    pub block_id: String,
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// One row of one contract table, inserted/updated (`present`) or removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDelta {
    pub contract: String,
    pub table: String,
    pub scope: String,
    pub primary_key: String,
    pub present: bool,
    pub value: Value,
}

/// One executed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTrace {
    pub global_sequence: u64,
    pub contract: String,
    pub action: String,
    pub data: Value,
    pub tx_id: String,
    /// Authorizing actors (`actor@permission`).
    #[serde(default)]
    pub authorization: Vec<String>,
}

/// A decoded record delivered to processors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Delta(TableDelta),
    Action(ActionTrace),
}

impl Record {
    /// The registry key processors are matched against.
    pub fn key(&self) -> RecordKey {
        match self {
            Self::Delta(d) => RecordKey::table(&d.contract, &d.table),
            Self::Action(a) => RecordKey::action(&a.contract, &a.action),
        }
    }

    pub fn as_delta(&self) -> Option<&TableDelta> {
        match self {
            Self::Delta(d) => Some(d),
            Self::Action(_) => None,
        }
    }

    pub fn as_action(&self) -> Option<&ActionTrace> {
        match self {
            Self::Action(a) => Some(a),
            Self::Delta(_) => None,
        }
    }
}

/// What a record is matched on: (contract, table) or (contract, action).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKey {
    Table { contract: String, table: String },
    Action { contract: String, action: String },
}

impl RecordKey {
    pub fn table(contract: impl Into<String>, table: impl Into<String>) -> Self {
        Self::Table {
            contract: contract.into(),
            table: table.into(),
        }
    }

    pub fn action(contract: impl Into<String>, action: impl Into<String>) -> Self {
        Self::Action {
            contract: contract.into(),
            action: action.into(),
        }
    }

    pub fn contract(&self) -> &str {
        match self {
            Self::Table { contract, .. } | Self::Action { contract, .. } => contract,
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table { contract, table } => write!(f, "{contract}::{table} (table)"),
            Self::Action { contract, action } => write!(f, "{contract}::{action} (action)"),
        }
    }
}

// ─── DecodedBlock ────────────────────────────────────────────────────────────

/// A block after the decode stage: header plus records in block order
/// (table deltas first, then action traces by global sequence).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBlock {
    pub header: BlockHeader,
    pub records: Vec<Record>,
}

/// Output of the decode stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Block(DecodedBlock),
    /// Blocks from this number onward are replaced by a new branch.
    Fork(u64),
}

// ─── Reader state ────────────────────────────────────────────────────────────

/// Lifecycle of a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReaderState {
    Init,
    CatchingUp,
    Live,
    /// Observation only: no progress within the stall timeout.
    Stalled,
    Stopped,
    Failed,
}

impl std::fmt::Display for ReaderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::CatchingUp => write!(f, "catching-up"),
            Self::Live => write!(f, "live"),
            Self::Stalled => write!(f, "stalled"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of a reader's progress, published after every block.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderStatus {
    pub reader: String,
    pub state: ReaderState,
    /// Last committed block.
    pub block: u64,
    /// Chain head as last reported by the node.
    pub head: u64,
    pub blocks_per_sec: f64,
    pub writes_per_sec: f64,
    /// Estimated seconds until caught up; `None` when unknown or never.
    pub eta_secs: Option<f64>,
}

impl ReaderStatus {
    pub fn new(reader: impl Into<String>) -> Self {
        Self {
            reader: reader.into(),
            state: ReaderState::Init,
            block: 0,
            head: 0,
            blocks_per_sec: 0.0,
            writes_per_sec: 0.0,
            eta_secs: None,
        }
    }

    pub fn blocks_remaining(&self) -> u64 {
        self.head.saturating_sub(self.block)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keys_separate_tables_and_actions() {
        let delta = Record::Delta(TableDelta {
            contract: "eosio.token".into(),
            table: "transfer".into(),
            scope: "alice".into(),
            primary_key: "1".into(),
            present: true,
            value: Value::Null,
        });
        let action = Record::Action(ActionTrace {
            global_sequence: 1,
            contract: "eosio.token".into(),
            action: "transfer".into(),
            data: Value::Null,
            tx_id: "ab".into(),
            authorization: vec![],
        });
        assert_ne!(delta.key(), action.key());
        assert_eq!(delta.key().contract(), "eosio.token");
        assert!(delta.as_delta().is_some());
        assert!(action.as_action().is_some());
    }

    #[test]
    fn status_blocks_remaining_saturates() {
        let mut status = ReaderStatus::new("main");
        status.block = 120;
        status.head = 100;
        assert_eq!(status.blocks_remaining(), 0);
        status.head = 150;
        assert_eq!(status.blocks_remaining(), 30);
    }
}
