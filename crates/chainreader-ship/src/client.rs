//! Stream client — an ordered, reconnecting block feed.
//!
//! A background task owns the node connection and pushes messages into a
//! bounded channel of `prefetch` slots; that channel is the pipeline's
//! backpressure point. Guarantees for the receiving side:
//!
//! - blocks arrive in strictly increasing order, except right after a
//!   `Fork(n)`, after which delivery restarts at `n`;
//! - re-deliveries of already delivered blocks are dropped with a warning, and
//!   a different block at an already delivered height becomes a fork;
//! - gaps and blocks that do not link to their parent are fatal, except when
//!   the parent is a block committed before this session: that block was
//!   forked out while the reader was away, so a `Fork` at its height is
//!   delivered and streaming restarts there;
//! - a dropped connection reconnects with exponential backoff from the block
//!   after the last one delivered; when the retry budget is spent the channel
//!   yields `RetryExhausted` and closes.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use chainreader_core::config::RetryConfig;
use chainreader_core::error::IndexerError;
use chainreader_core::types::BlockPosition;

use crate::envelope::SourceMessage;
use crate::source::{BlockRequest, BlockSource};
use crate::tracker::{Arrival, BlockTracker, TrackedBlock};

/// Receiving side of the stream client.
pub type BlockReceiver = mpsc::Receiver<Result<SourceMessage, IndexerError>>;

const TRACKER_WINDOW: usize = 1024;

pub struct StreamClient {
    reader: String,
    source: Arc<dyn BlockSource>,
    retry: RetryConfig,
    prefetch: usize,
    committed: Vec<BlockPosition>,
}

impl StreamClient {
    pub fn new(reader: impl Into<String>, source: Arc<dyn BlockSource>, retry: RetryConfig, prefetch: usize) -> Self {
        Self {
            reader: reader.into(),
            source,
            retry,
            prefetch: prefetch.max(1),
            committed: Vec::new(),
        }
    }

    /// Blocks already committed by earlier sessions. The first block streamed
    /// must link to the newest of them, and the node is told about all of them.
    pub fn committed(mut self, committed: Vec<BlockPosition>) -> Self {
        self.committed = committed;
        self
    }

    /// Start streaming from `start_block` (through `end_block`, if set).
    ///
    /// Dropping the receiver stops the background task.
    pub fn connect(self, start_block: u64, end_block: Option<u64>) -> BlockReceiver {
        let (tx, rx) = mpsc::channel(self.prefetch);
        tokio::spawn(async move {
            let reader = self.reader.clone();
            if let Err(e) = self.stream_task(start_block, end_block, &tx).await {
                error!(reader = %reader, error = %e, "block stream failed");
                let _ = tx.send(Err(e)).await;
            }
        });
        rx
    }

    async fn stream_task(
        self,
        start_block: u64,
        end_block: Option<u64>,
        tx: &mpsc::Sender<Result<SourceMessage, IndexerError>>,
    ) -> Result<(), IndexerError> {
        let mut tracker = BlockTracker::resume(TRACKER_WINDOW, start_block, &self.committed);
        let mut attempt: u32 = 0;
        let mut last_error = String::new();

        loop {
            if end_block.is_some_and(|end| tracker.expected() > end) {
                debug!(reader = %self.reader, "end block delivered, stream closing");
                return Ok(());
            }
            if attempt > 0 {
                let Some(delay) = self.retry.next_delay(attempt) else {
                    return Err(IndexerError::RetryExhausted {
                        attempts: attempt - 1,
                        last_error,
                    });
                };
                warn!(
                    reader = %self.reader,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "block stream reconnecting"
                );
                tokio::time::sleep(delay).await;
            }

            let request = BlockRequest {
                start_block: tracker.expected(),
                end_block,
                max_messages_in_flight: self.prefetch as u32,
                have_positions: tracker.positions(),
            };
            let mut messages = match self.source.open(&request).await {
                Ok(m) => m,
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    last_error = e.to_string();
                    continue;
                }
                Err(e) => return Err(e),
            };
            info!(reader = %self.reader, start = request.start_block, "block stream opened");

            let reopen = loop {
                let message = match messages.next().await {
                    None => {
                        last_error = "stream ended".into();
                        break false;
                    }
                    Some(Err(e)) if e.is_transient() => {
                        last_error = e.to_string();
                        break false;
                    }
                    Some(Err(e)) => return Err(e),
                    Some(Ok(m)) => m,
                };

                let forwarded = match message {
                    SourceMessage::Fork { block_num } => {
                        if block_num > tracker.expected() {
                            debug!(reader = %self.reader, fork = block_num, "fork beyond delivered blocks ignored");
                            continue;
                        }
                        warn!(reader = %self.reader, fork = block_num, "fork notification");
                        tracker.rewind_to(block_num.saturating_sub(1));
                        vec![SourceMessage::Fork { block_num }]
                    }
                    SourceMessage::Block(raw) => {
                        let tracked = TrackedBlock {
                            number: raw.block_num,
                            id: raw.block_id.clone(),
                            prev_id: raw.prev_id.clone(),
                        };
                        match tracker.classify(raw.block_num, &raw.block_id, &raw.prev_id) {
                            Arrival::Next => {
                                tracker.push(tracked);
                                vec![SourceMessage::Block(raw)]
                            }
                            Arrival::Duplicate => {
                                warn!(reader = %self.reader, block = raw.block_num, "duplicate block dropped");
                                continue;
                            }
                            Arrival::Replaces(number) => {
                                warn!(reader = %self.reader, block = number, "block replaced without fork notice, forking");
                                tracker.push(tracked);
                                vec![SourceMessage::Fork { block_num: number }, SourceMessage::Block(raw)]
                            }
                            Arrival::Orphaned(number) => {
                                warn!(
                                    reader = %self.reader,
                                    block = number,
                                    next_prev = %raw.prev_id,
                                    "committed block is no longer on the chain, forking"
                                );
                                tracker.rewind_to(number.saturating_sub(1));
                                if tx.send(Ok(SourceMessage::Fork { block_num: number })).await.is_err() {
                                    return Ok(());
                                }
                                break true;
                            }
                            Arrival::Unlinked { expected_prev } => {
                                return Err(IndexerError::StreamOrder(format!(
                                    "block {} links to {} but {} was delivered before it",
                                    raw.block_num, raw.prev_id, expected_prev
                                )));
                            }
                            Arrival::Gap { expected } => {
                                return Err(IndexerError::StreamOrder(format!(
                                    "expected block {expected}, got {}",
                                    raw.block_num
                                )));
                            }
                        }
                    }
                };

                attempt = 0;
                for item in forwarded {
                    if tx.send(Ok(item)).await.is_err() {
                        debug!(reader = %self.reader, "block receiver dropped, stream closing");
                        return Ok(());
                    }
                }
                if end_block.is_some_and(|end| tracker.expected() > end) {
                    debug!(reader = %self.reader, "end block delivered, stream closing");
                    return Ok(());
                }
            };
            if reopen {
                attempt = 0;
            } else {
                attempt += 1;
            }
        }
    }
}
