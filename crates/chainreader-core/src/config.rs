//! Reader configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Configuration for one reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Unique reader name (checkpoint key, row scope).
    pub name: String,
    /// Block-stream endpoint (e.g. `ws://127.0.0.1:8080`).
    pub endpoint: String,
    /// First block to index when no checkpoint exists.
    pub start_block: u64,
    /// Optional last block (bounded run). `None` = follow the chain forever.
    pub end_block: Option<u64>,
    /// Maximum blocks requested ahead of processing.
    pub prefetch: usize,
    /// Concurrent decode workers.
    pub decode_workers: usize,
    /// Reader is live once `head - block <= live_threshold`.
    pub live_threshold: u64,
    /// Seconds without block progress before the watchdog fires.
    pub stall_timeout_secs: u64,
    /// How often the watchdog samples progress.
    pub watchdog_interval_secs: u64,
    /// Delete all handler data and re-index from `start_block` on start.
    pub resync: bool,
    /// Sliding window for speed accounting.
    pub speed_window_secs: u64,
    /// Blocks/s the chain produces (for catch-up estimates).
    pub chain_blocks_per_sec: f64,
    /// Stream reconnect policy.
    pub retry: RetryConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            name: "main".into(),
            endpoint: "ws://127.0.0.1:8080".into(),
            start_block: 1,
            end_block: None,
            prefetch: 50,
            decode_workers: 4,
            live_threshold: 3,
            stall_timeout_secs: 120,
            watchdog_interval_secs: 10,
            resync: false,
            speed_window_secs: 60,
            chain_blocks_per_sec: 2.0,
            retry: RetryConfig::default(),
        }
    }
}

impl ReaderConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.name.is_empty() {
            return Err(IndexerError::Config("reader name must not be empty".into()));
        }
        if self.prefetch == 0 {
            return Err(IndexerError::Config("prefetch must be at least 1".into()));
        }
        if self.decode_workers == 0 {
            return Err(IndexerError::Config("decode_workers must be at least 1".into()));
        }
        if let Some(end) = self.end_block {
            if end < self.start_block {
                return Err(IndexerError::Config(format!(
                    "end_block {end} is before start_block {}",
                    self.start_block
                )));
            }
        }
        if self.stall_timeout_secs == 0 || self.watchdog_interval_secs == 0 {
            return Err(IndexerError::Config("watchdog timings must be non-zero".into()));
        }
        Ok(())
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn speed_window(&self) -> Duration {
        Duration::from_secs(self.speed_window_secs)
    }
}

/// Exponential backoff for stream reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Reconnect attempts before giving up (not counting the first connect).
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the `attempt`-th retry (1-based), or `None` once the budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32 - 1);
        let capped = base.min(self.max_backoff_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }
}
