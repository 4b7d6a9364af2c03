//! Operator configuration file (`chainreader run <config.json>`).

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use chainreader_core::ReaderConfig;

use crate::logging::LogConfig;

/// Everything `run` needs, loaded from one JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub reader: ReaderConfig,
    pub log: LogConfig,
    /// SQLite file path, or `":memory:"` for a throwaway in-process store.
    pub database: DatabaseConfig,
    /// ABI file per contract account.
    pub abis: BTreeMap<String, String>,
    /// Index a standard token contract.
    pub token: Option<TokenConfig>,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "chainreader.db".into(),
        }
    }
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub contract: String,
    #[serde(default)]
    pub start_block: u64,
}

/// Maintenance job timings, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub start_delay_secs: u64,
    pub tick_secs: u64,
    pub status_interval_secs: u64,
    pub checkpoint_interval_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            start_delay_secs: 30,
            tick_secs: 1,
            status_interval_secs: 60,
            checkpoint_interval_secs: 300,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.reader.validate().context("invalid reader configuration")?;
        anyhow::ensure!(config.jobs.tick_secs > 0, "jobs.tick_secs must be at least 1");
        Ok(config)
    }
}
