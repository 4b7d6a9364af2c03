//! The reader — drives one block stream into the handlers.
//!
//! # Lifecycle
//! `INIT` → load (or create) the checkpoint, prepare every handler.
//! `CATCHING_UP` / `LIVE` → for each block, in order:
//!   - open a transaction
//!   - dispatch the block's records to the registered processors
//!   - record the previous checkpoint in the undo log (reversible blocks)
//!   - advance the checkpoint (written last) and commit
//!
//! On `Fork(n)` every committed block from the checkpoint down to `n` is
//! reverted newest first, one transaction per block, each restoring the
//! checkpoint recorded for it, and handlers reload their caches. On resume the
//! stream is told which blocks are committed, so a branch switch that
//! happened while the reader was down still reverts the orphaned blocks. A processor error rolls the block back and stops the reader
//! with the checkpoint still on the last good block.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use chainreader_core::checkpoint::ReaderCheckpoint;
use chainreader_core::config::ReaderConfig;
use chainreader_core::error::IndexerError;
use chainreader_core::handler::{teardown, HandlerSet, TableSnapshot};
use chainreader_core::processor::{DataProcessor, Registration};
use chainreader_core::progress::{estimate_catch_up_secs, SpeedMeter, ETA_MAX_DEPTH};
use chainreader_core::scheduler::wait_for_stop;
use chainreader_core::store::{Store, UndoEntry};
use chainreader_core::types::{BlockPosition, DecodedBlock, ReaderState, ReaderStatus, StreamItem};
use chainreader_core::writer::{revert_block, BlockWriter};

use crate::client::StreamClient;
use crate::decode::{AbiRegistry, DecodeQueue};
use crate::source::BlockSource;

/// Blocks between periodic progress lines while catching up.
const PROGRESS_EVERY: u64 = 1_000;

/// Control side of a running [`Reader`].
#[derive(Clone)]
pub struct ReaderHandle {
    stop: Arc<watch::Sender<bool>>,
    status: watch::Receiver<ReaderStatus>,
}

impl ReaderHandle {
    /// Ask the reader to stop after the block it is working on.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Subscribe to status updates.
    pub fn status(&self) -> watch::Receiver<ReaderStatus> {
        self.status.clone()
    }

    /// The latest published status.
    pub fn current(&self) -> ReaderStatus {
        self.status.borrow().clone()
    }

    /// A receiver that flips to `true` when [`ReaderHandle::stop`] is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }
}

/// One reader: a stream client, a decode queue and a handler set over a store.
pub struct Reader {
    config: ReaderConfig,
    store: Arc<dyn Store>,
    source: Arc<dyn BlockSource>,
    handlers: HandlerSet,
    abis: Arc<AbiRegistry>,
    snapshot: Arc<dyn TableSnapshot>,
    status: watch::Sender<ReaderStatus>,
    /// Shared with every handle, so dropping handles never reads as a stop.
    stop: Arc<watch::Sender<bool>>,
}

impl Reader {
    pub(crate) fn new(
        config: ReaderConfig,
        store: Arc<dyn Store>,
        source: Arc<dyn BlockSource>,
        handlers: HandlerSet,
        abis: AbiRegistry,
        snapshot: Arc<dyn TableSnapshot>,
    ) -> (Self, ReaderHandle) {
        let (stop_tx, _) = watch::channel(false);
        let stop = Arc::new(stop_tx);
        let (status_tx, status_rx) = watch::channel(ReaderStatus::new(config.name.clone()));
        let reader = Self {
            config,
            store,
            source,
            handlers,
            abis: Arc::new(abis),
            snapshot,
            status: status_tx,
            stop: Arc::clone(&stop),
        };
        let handle = ReaderHandle {
            stop,
            status: status_rx,
        };
        (reader, handle)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Run until the end block is committed, a stop is requested, or an
    /// unrecoverable error occurs. Returns the final checkpoint.
    pub async fn run(self) -> Result<ReaderCheckpoint, IndexerError> {
        let mut processor = DataProcessor::new();
        let (checkpoint, registrations) = match self.start(&mut processor).await {
            Ok(started) => started,
            Err(e) => {
                error!(reader = %self.config.name, error = %e, "reader failed to start");
                self.finish(ReaderState::Failed);
                return Err(e);
            }
        };

        let outcome = self.follow(&processor, checkpoint).await;
        teardown(&mut processor, registrations);

        match outcome {
            Ok(checkpoint) => {
                info!(reader = %self.config.name, block = checkpoint.block_num, "reader stopped");
                self.finish(ReaderState::Stopped);
                Ok(checkpoint)
            }
            Err(e) => {
                self.finish(ReaderState::Failed);
                Err(e)
            }
        }
    }

    // ─── Startup ────────────────────────────────────────────────────────────────

    async fn start(&self, processor: &mut DataProcessor) -> Result<(ReaderCheckpoint, Vec<Registration>), IndexerError> {
        let name = self.config.name.as_str();
        self.status.send_modify(|s| s.state = ReaderState::Init);

        if self.config.resync {
            warn!(reader = name, "resync requested, deleting all handler data");
            self.handlers.delete_all(self.store.as_ref(), name).await?;
        }

        let checkpoint = match self.store.load_checkpoint(name).await? {
            Some(cp) => {
                info!(reader = name, block = cp.block_num, irreversible = cp.irreversible, "resuming from checkpoint");
                cp
            }
            None => {
                let cp = ReaderCheckpoint::genesis(name);
                let mut tx = self.store.begin(name).await?;
                tx.save_checkpoint(&cp).await?;
                tx.commit().await?;
                info!(reader = name, "checkpoint created");
                cp
            }
        };

        let registrations = self
            .handlers
            .prepare(self.store.as_ref(), &checkpoint, self.snapshot.as_ref(), processor)
            .await?;
        Ok((checkpoint, registrations))
    }

    // ─── Main loop ──────────────────────────────────────────────────────────────

    async fn follow(
        &self,
        processor: &DataProcessor,
        mut checkpoint: ReaderCheckpoint,
    ) -> Result<ReaderCheckpoint, IndexerError> {
        let name = self.config.name.as_str();
        let end_block = self.config.end_block;
        if self.end_reached(&checkpoint) {
            info!(reader = name, block = checkpoint.block_num, "end block already committed");
            return Ok(checkpoint);
        }

        let start = checkpoint.next_block().max(self.config.start_block);
        let committed = if start == checkpoint.next_block() {
            self.committed_chain(&checkpoint).await?
        } else {
            Vec::new()
        };
        let client = StreamClient::new(
            name,
            Arc::clone(&self.source),
            self.config.retry.clone(),
            self.config.prefetch,
        )
        .committed(committed);
        let items = DecodeQueue::new(Arc::clone(&self.abis), self.config.decode_workers).run(client.connect(start, end_block));
        futures::pin_mut!(items);

        let mut meter = SpeedMeter::new(self.config.speed_window());
        let mut head = checkpoint.block_num;
        let mut stop = self.stop.subscribe();
        self.report(&checkpoint, head, &meter);
        info!(reader = name, start, end = ?end_block, "reader started");

        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_stop(&mut stop) => None,
                item = items.next() => Some(item),
            };
            let Some(item) = next else {
                info!(reader = name, block = checkpoint.block_num, "stop requested");
                return Ok(checkpoint);
            };

            match item {
                None => {
                    return Err(IndexerError::Aborted {
                        reason: format!("block stream closed after block {}", checkpoint.block_num),
                    });
                }
                Some(Err(e)) => {
                    error!(reader = name, block = checkpoint.block_num, error = %e, "block stream failed");
                    return Err(e);
                }
                Some(Ok(StreamItem::Block(block))) => {
                    let number = block.header.number;
                    head = block.header.head;
                    let writes = match self.apply_block(processor, &mut checkpoint, block).await {
                        Ok(writes) => writes,
                        Err(e) => {
                            error!(reader = name, block = number, error = %e, "block failed, rolled back");
                            return Err(e);
                        }
                    };
                    meter.record(Instant::now(), 1, writes);
                    self.report(&checkpoint, head, &meter);

                    if self.end_reached(&checkpoint) {
                        info!(reader = name, block = checkpoint.block_num, "end block reached");
                        return Ok(checkpoint);
                    }
                }
                Some(Ok(StreamItem::Fork(fork_block))) => {
                    if let Err(e) = self.rollback(&mut checkpoint, fork_block).await {
                        error!(reader = name, fork = fork_block, error = %e, "rollback failed");
                        return Err(e);
                    }
                    meter.reset();
                    self.report(&checkpoint, head, &meter);
                }
            }
        }
    }

    /// Committed blocks with a known id, oldest first: the checkpoint block and
    /// the parents recorded for the blocks still in the undo log.
    async fn committed_chain(&self, checkpoint: &ReaderCheckpoint) -> Result<Vec<BlockPosition>, IndexerError> {
        let Some(head) = checkpoint.position() else {
            return Ok(Vec::new());
        };
        let mut chain = vec![head];
        let mut tx = self.store.begin(&self.config.name).await?;
        for block in tx.undo_blocks_from(0).await? {
            if block > checkpoint.block_num {
                continue;
            }
            let entries = tx.undo_entries(block).await?;
            let before = match entries.iter().rev().find(|e| e.is_checkpoint()) {
                Some(entry) => entry.checkpoint_before()?,
                None => None,
            };
            if let Some(parent) = before.and_then(|cp| cp.position()) {
                chain.push(parent);
            }
        }
        tx.rollback().await?;
        chain.reverse();
        Ok(chain)
    }

    fn end_reached(&self, checkpoint: &ReaderCheckpoint) -> bool {
        self.config.end_block.is_some_and(|end| checkpoint.block_num >= end)
    }

    /// Process one block in one transaction. Returns the number of row writes.
    async fn apply_block(
        &self,
        processor: &DataProcessor,
        checkpoint: &mut ReaderCheckpoint,
        block: DecodedBlock,
    ) -> Result<u64, IndexerError> {
        let header = block.header;
        if header.number <= checkpoint.block_num {
            return Err(IndexerError::StreamOrder(format!(
                "block {} is at or below checkpoint {}",
                header.number, checkpoint.block_num
            )));
        }

        let mut tx = self.store.begin(&self.config.name).await?;
        let mut writer = BlockWriter::new(tx.as_mut(), header.number, !header.irreversible);
        let dispatched = processor.dispatch(&mut writer, &header, &block.records).await;
        let writes = writer.writes();
        let calls = match dispatched {
            Ok(calls) => calls,
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(reader = %self.config.name, block = header.number, error = %rb, "rollback failed");
                }
                return Err(e);
            }
        };

        if !header.irreversible {
            tx.append_undo(&UndoEntry::checkpoint(header.number, checkpoint)?).await?;
        }
        let live = header.blocks_behind_head() <= self.config.live_threshold;
        let next = checkpoint.advance(&header, live);
        let pruned = tx.prune_undo(next.irreversible).await?;
        tx.save_checkpoint(&next).await?;
        tx.commit().await?;

        debug!(
            reader = %self.config.name,
            block = header.number,
            calls,
            writes,
            pruned,
            reversible = !header.irreversible,
            "block committed"
        );
        *checkpoint = next;
        Ok(writes)
    }

    /// Revert every committed block at or above `fork_block`, newest first.
    async fn rollback(&self, checkpoint: &mut ReaderCheckpoint, fork_block: u64) -> Result<(), IndexerError> {
        let name = self.config.name.as_str();
        if fork_block <= checkpoint.irreversible {
            return Err(IndexerError::ForkBeyondIrreversible {
                fork_block,
                irreversible: checkpoint.irreversible,
            });
        }
        if fork_block > checkpoint.block_num {
            debug!(reader = name, fork = fork_block, block = checkpoint.block_num, "fork above checkpoint, nothing to revert");
            return Ok(());
        }

        warn!(reader = name, fork = fork_block, from = checkpoint.block_num, "fork, rolling back");
        for block in (fork_block..=checkpoint.block_num).rev() {
            let mut tx = self.store.begin(name).await?;
            let reverted = revert_block(tx.as_mut(), block).await?;
            let rewound = checkpoint.rewind(block, reverted.checkpoint);
            tx.save_checkpoint(&rewound).await?;
            tx.commit().await?;
            debug!(reader = name, block, entries = reverted.entries, "block reverted");
            *checkpoint = rewound;
        }

        self.handlers.after_rollback(self.store.as_ref(), name).await?;
        info!(reader = name, block = checkpoint.block_num, "rollback complete");
        Ok(())
    }

    // ─── Status ─────────────────────────────────────────────────────────────────

    fn report(&self, checkpoint: &ReaderCheckpoint, head: u64, meter: &SpeedMeter) {
        let head = head.max(checkpoint.block_num);
        let remaining = head - checkpoint.block_num;
        let state = if checkpoint.live {
            ReaderState::Live
        } else {
            ReaderState::CatchingUp
        };
        let blocks_per_sec = meter.blocks_per_sec();
        let eta_secs = estimate_catch_up_secs(
            remaining as f64,
            blocks_per_sec,
            self.config.chain_blocks_per_sec,
            ETA_MAX_DEPTH,
        );

        let previous = self.status.send_replace(ReaderStatus {
            reader: self.config.name.clone(),
            state,
            block: checkpoint.block_num,
            head,
            blocks_per_sec,
            writes_per_sec: meter.writes_per_sec(),
            eta_secs,
        });

        if previous.state != state {
            info!(reader = %self.config.name, block = checkpoint.block_num, head, state = %state, "reader state changed");
        } else if state == ReaderState::CatchingUp && checkpoint.block_num % PROGRESS_EVERY == 0 {
            info!(
                reader = %self.config.name,
                block = checkpoint.block_num,
                head,
                blocks_per_sec = %format_args!("{blocks_per_sec:.1}"),
                eta_secs = ?eta_secs.map(|s| s.round()),
                "catching up"
            );
        }
    }

    fn finish(&self, state: ReaderState) {
        self.status.send_modify(|s| s.state = state);
    }
}
