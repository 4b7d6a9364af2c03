//! Stall watchdog.
//!
//! Samples the reader's published status on a fixed interval. When the
//! committed block has not moved for `timeout` while the node still reports
//! blocks ahead, the exit hook runs once and the watchdog stops. Recovery is
//! left to whatever supervises the process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::types::{ReaderState, ReaderStatus};

/// Invoked once when a stall is confirmed.
pub type ExitHook = Arc<dyn Fn(&ReaderStatus) + Send + Sync>;

/// Result of one progress sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Block advanced, or nothing left to do.
    Progressing,
    /// No advance yet, still inside the timeout.
    Stalled(Duration),
    /// No advance for at least the timeout.
    TimedOut(Duration),
}

/// Pure stall bookkeeping, separate from the timer.
#[derive(Debug)]
pub struct StallDetector {
    timeout: Duration,
    last_block: u64,
    since: Instant,
}

impl StallDetector {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            last_block: 0,
            since: now,
        }
    }

    pub fn observe(&mut self, status: &ReaderStatus, now: Instant) -> Verdict {
        if status.block != self.last_block || status.blocks_remaining() == 0 {
            self.last_block = status.block;
            self.since = now;
            return Verdict::Progressing;
        }
        let idle = now.saturating_duration_since(self.since);
        if idle >= self.timeout {
            Verdict::TimedOut(idle)
        } else {
            Verdict::Stalled(idle)
        }
    }
}

/// Default exit path: log and terminate with a non-zero status.
pub fn exit_process() -> ExitHook {
    Arc::new(|status: &ReaderStatus| {
        error!(
            reader = %status.reader,
            block = status.block,
            head = status.head,
            "reader stalled, exiting for restart"
        );
        std::process::exit(1);
    })
}

pub struct Watchdog {
    status: watch::Receiver<ReaderStatus>,
    interval: Duration,
    timeout: Duration,
    on_stall: ExitHook,
}

impl Watchdog {
    pub fn new(status: watch::Receiver<ReaderStatus>, interval: Duration, timeout: Duration) -> Self {
        Self {
            status,
            interval,
            timeout,
            on_stall: exit_process(),
        }
    }

    /// Replace the exit path (tests, embedding).
    pub fn with_exit_hook(mut self, hook: ExitHook) -> Self {
        self.on_stall = hook;
        self
    }

    /// Watch until a stall fires, the reader reaches a terminal state, or
    /// `shutdown` is set. Returns `true` if the exit hook ran.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> bool {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut detector = StallDetector::new(self.timeout, Instant::now());
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "watchdog started"
        );

        loop {
            tokio::select! {
                now = ticker.tick() => {
                    let status = self.status.borrow().clone();
                    if matches!(status.state, ReaderState::Stopped | ReaderState::Failed) {
                        debug!(reader = %status.reader, state = %status.state, "reader finished, watchdog exiting");
                        return false;
                    }
                    match detector.observe(&status, now) {
                        Verdict::Progressing => {}
                        Verdict::Stalled(idle) => debug!(
                            reader = %status.reader,
                            block = status.block,
                            state = %ReaderState::Stalled,
                            idle_secs = idle.as_secs(),
                            "no block progress"
                        ),
                        Verdict::TimedOut(idle) => {
                            warn!(
                                reader = %status.reader,
                                block = status.block,
                                remaining = status.blocks_remaining(),
                                idle_secs = idle.as_secs(),
                                "stall timeout reached"
                            );
                            (self.on_stall)(&status);
                            return true;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }
}
