//! Job scheduler for periodic maintenance work.
//!
//! A single cooperative task: every tick, the jobs that are due and not
//! already running are started in priority order (HIGH → MEDIUM → LOW). Each
//! started job is its own future, polled on the scheduler task alongside the
//! ticker, so a slow job neither stalls the ticker nor holds back the jobs
//! queued after it. A job still running from an earlier tick is skipped.
//! Failures are logged and swallowed; they never reach the reader.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::IndexerError;

/// Priority bucket of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobPriority {
    High,
    Medium,
    Low,
}

type JobFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), IndexerError>> + Send + Sync>;

struct Job {
    name: String,
    interval: Duration,
    priority: JobPriority,
    callback: JobFn,
    last_started: Option<Instant>,
    running: Arc<AtomicBool>,
}

/// Cooperative periodic job scheduler.
pub struct JobQueue {
    jobs: Vec<Job>,
    start_delay: Duration,
    tick: Duration,
}

impl JobQueue {
    /// A queue that starts ticking every `tick` after `start_delay`.
    pub fn new(start_delay: Duration, tick: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            start_delay,
            tick,
        }
    }

    /// Add a job that runs every `interval_secs` seconds. It is due on the first tick.
    pub fn add<F, Fut>(&mut self, name: impl Into<String>, interval_secs: u64, priority: JobPriority, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), IndexerError>> + Send + 'static,
    {
        let name = name.into();
        debug!(job = %name, interval_secs, ?priority, "job added");
        self.jobs.push(Job {
            name,
            interval: Duration::from_secs(interval_secs),
            priority,
            callback: Arc::new(move || Box::pin(callback()) as BoxFuture<'static, _>),
            last_started: None,
            running: Arc::new(AtomicBool::new(false)),
        });
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Start the jobs due at `now`, highest priority first.
    ///
    /// Each returned future is one job invocation; the job counts as busy
    /// until its future completes.
    pub fn tick(&mut self, now: Instant) -> Vec<BoxFuture<'static, ()>> {
        let mut due: Vec<usize> = Vec::new();
        for (idx, job) in self.jobs.iter().enumerate() {
            let elapsed_ok = job
                .last_started
                .map_or(true, |t| now.saturating_duration_since(t) >= job.interval);
            if !elapsed_ok {
                continue;
            }
            if job.running.load(Ordering::Acquire) {
                debug!(job = %job.name, "job still running, skipped");
                continue;
            }
            due.push(idx);
        }
        // stable: equal priorities keep insertion order
        due.sort_by_key(|&idx| self.jobs[idx].priority);

        due.into_iter()
            .map(|idx| {
                let job = &mut self.jobs[idx];
                job.last_started = Some(now);
                job.running.store(true, Ordering::Release);
                let name = job.name.clone();
                let running = Arc::clone(&job.running);
                let invocation = (job.callback)();
                Box::pin(async move {
                    let started = Instant::now();
                    match invocation.await {
                        Ok(()) => debug!(job = %name, elapsed_ms = started.elapsed().as_millis() as u64, "job finished"),
                        Err(e) => warn!(job = %name, error = %e, "job failed"),
                    }
                    running.store(false, Ordering::Release);
                }) as BoxFuture<'static, ()>
            })
            .collect()
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(jobs = self.jobs.len(), delay_secs = self.start_delay.as_secs(), "job scheduler waiting for start delay");
        tokio::select! {
            _ = tokio::time::sleep(self.start_delay) => {}
            _ = wait_for_stop(&mut shutdown) => return,
        }

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut active = FuturesUnordered::new();
        loop {
            tokio::select! {
                now = ticker.tick() => {
                    // FuturesUnordered polls new futures in push order
                    active.extend(self.tick(now));
                }
                Some(()) = active.next(), if !active.is_empty() => {}
                _ = wait_for_stop(&mut shutdown) => break,
            }
        }
        info!("job scheduler stopped");
    }
}

/// Resolve once `shutdown` is `true` or its sender is gone.
pub async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[tokio::test]
    async fn due_jobs_run_in_priority_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut queue = JobQueue::new(Duration::ZERO, Duration::from_secs(1));
        for (name, priority) in [("low", JobPriority::Low), ("high", JobPriority::High), ("medium", JobPriority::Medium)] {
            let order = Arc::clone(&order);
            queue.add(name, 5, priority, move || {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(name);
                    Ok(())
                }
            });
        }
        let started: FuturesUnordered<_> = queue.tick(Instant::now()).into_iter().collect();
        started.collect::<Vec<()>>().await;
        assert_eq!(*order.lock().unwrap(), vec!["high", "medium", "low"]);
    }

    #[tokio::test]
    async fn busy_job_is_skipped_and_failures_are_swallowed() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut queue = JobQueue::new(Duration::ZERO, Duration::from_secs(1));
        let r = Arc::clone(&runs);
        queue.add("flaky", 1, JobPriority::Medium, move || {
            let r = Arc::clone(&r);
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                Err(IndexerError::Other("nope".into()))
            }
        });

        let start = Instant::now();
        let mut pending = queue.tick(start);
        assert_eq!(pending.len(), 1);
        // not yet driven → still running
        assert!(queue.tick(start + Duration::from_secs(2)).is_empty());
        pending.remove(0).await;
        for job in queue.tick(start + Duration::from_secs(2)) {
            job.await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        // not due yet
        assert!(queue.tick(start + Duration::from_millis(2_500)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_job_does_not_hold_back_lower_priority() {
        let done = Arc::new(Mutex::new(Vec::new()));
        let mut queue = JobQueue::new(Duration::ZERO, Duration::from_secs(1));
        for (name, priority, secs) in [("rebuild", JobPriority::High, 30), ("cleanup", JobPriority::Low, 0)] {
            let done = Arc::clone(&done);
            queue.add(name, 5, priority, move || {
                let done = Arc::clone(&done);
                async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    done.lock().unwrap().push(name);
                    Ok(())
                }
            });
        }

        let start = Instant::now();
        let mut active: FuturesUnordered<_> = queue.tick(start).into_iter().collect();
        active.next().await;
        assert_eq!(*done.lock().unwrap(), vec!["cleanup"]);
        // cleanup finished and is due again; rebuild is still busy
        let next = queue.tick(start + Duration::from_secs(5));
        assert_eq!(next.len(), 1);
        active.extend(next);
        while active.next().await.is_some() {}
        assert_eq!(*done.lock().unwrap(), vec!["cleanup", "cleanup", "rebuild"]);
    }

    #[tokio::test(start_paused = true)]
    async fn eleven_ticks_run_each_job_at_least_twice_without_reentry() {
        let mut queue = JobQueue::new(Duration::ZERO, Duration::from_secs(1));
        let mut counters = Vec::new();
        for (name, priority) in [("rebuild", JobPriority::High), ("cleanup", JobPriority::Low)] {
            let runs = Arc::new(AtomicUsize::new(0));
            let active = Arc::new(AtomicUsize::new(0));
            let max_active = Arc::new(AtomicUsize::new(0));
            counters.push((Arc::clone(&runs), Arc::clone(&max_active)));
            queue.add(name, 5, priority, move || {
                let runs = Arc::clone(&runs);
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                    // longer than the interval: the next due tick must skip
                    tokio::time::sleep(Duration::from_secs(6)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(queue.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(11_500)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        for (runs, max_active) in counters {
            assert!(runs.load(Ordering::SeqCst) >= 2, "runs={}", runs.load(Ordering::SeqCst));
            assert_eq!(max_active.load(Ordering::SeqCst), 1);
        }
    }
}
