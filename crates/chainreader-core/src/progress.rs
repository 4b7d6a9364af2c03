//! Progress accounting: sliding-window speeds and catch-up estimation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Blocks/s and writes/s over a sliding time window.
#[derive(Debug)]
pub struct SpeedMeter {
    window: Duration,
    /// (time, blocks, writes) per committed block, oldest first.
    samples: VecDeque<(Instant, u64, u64)>,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record `blocks` committed blocks carrying `writes` row writes at `now`.
    pub fn record(&mut self, now: Instant, blocks: u64, writes: u64) {
        self.samples.push_back((now, blocks, writes));
        while let Some(&(t, _, _)) = self.samples.front() {
            if now.duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Forget all samples (after a rollback the rates would be meaningless).
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    fn elapsed_secs(&self) -> Option<f64> {
        let first = self.samples.front()?.0;
        let last = self.samples.back()?.0;
        let secs = last.duration_since(first).as_secs_f64();
        (secs > 0.0).then_some(secs)
    }

    pub fn blocks_per_sec(&self) -> f64 {
        match self.elapsed_secs() {
            // The first sample only marks the window start.
            Some(secs) => self.samples.iter().skip(1).map(|s| s.1).sum::<u64>() as f64 / secs,
            None => 0.0,
        }
    }

    pub fn writes_per_sec(&self) -> f64 {
        match self.elapsed_secs() {
            Some(secs) => self.samples.iter().skip(1).map(|s| s.2).sum::<u64>() as f64 / secs,
            None => 0.0,
        }
    }
}

/// Default recursion depth for [`estimate_catch_up_secs`].
pub const ETA_MAX_DEPTH: u32 = 10;

/// Seconds until a reader processing `speed` blocks/s catches a head that
/// keeps growing at `chain_rate` blocks/s, with `remaining` blocks to go.
///
/// Each step covers the current distance; the blocks produced meanwhile
/// become the next step's distance. Base cases: nothing remaining → 0;
/// `depth == 0` → plain `remaining / speed`; a reader no faster than the
/// chain never catches up → `None`.
pub fn estimate_catch_up_secs(remaining: f64, speed: f64, chain_rate: f64, depth: u32) -> Option<f64> {
    if remaining <= 0.0 {
        return Some(0.0);
    }
    if speed <= 0.0 || speed <= chain_rate {
        return None;
    }
    let step = remaining / speed;
    if depth == 0 || step < 1.0 {
        return Some(step);
    }
    let produced = step * chain_rate;
    estimate_catch_up_secs(produced, speed, chain_rate, depth - 1).map(|rest| step + rest)
}
