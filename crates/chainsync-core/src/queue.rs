//! Work queue seam and the in-process default implementation.
//!
//! Delivery is at-least-once with no ordering guarantee across independent
//! jobs — event application must stay idempotent. Jobs are serializable so
//! an external queue backend can implement [`WorkQueue`] without touching
//! the engine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::SyncError;

/// A unit of work for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncJob {
    /// Catch an entity up toward the current ledger height.
    Run { address: String, chain_id: u64 },
    /// Recheck a caught-up entity for new blocks.
    Monitor { address: String, chain_id: u64 },
}

impl SyncJob {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Run { .. } => "run",
            Self::Monitor { .. } => "monitor",
        }
    }

    pub fn address(&self) -> &str {
        match self {
            Self::Run { address, .. } | Self::Monitor { address, .. } => address,
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            Self::Run { chain_id, .. } | Self::Monitor { chain_id, .. } => *chain_id,
        }
    }
}

/// Delivery options for one enqueued job.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Hold the job back for this long before it becomes runnable.
    pub delay: Option<Duration>,
    /// Attempts before the job is dropped. `None` = single attempt.
    pub max_attempts: Option<u32>,
    /// Base delay between attempts, doubled on each failure.
    pub backoff: Option<Duration>,
}

/// Executes jobs pulled off the queue.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &SyncJob) -> Result<(), SyncError>;
}

/// The queue seam the engine schedules through.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Submit a job. Fails with `QueueClosed` after [`WorkQueue::close`].
    async fn enqueue(&self, job: SyncJob, opts: JobOptions) -> Result<(), SyncError>;

    /// Drop queued and delayed jobs matching the predicate. Jobs already
    /// executing are not affected. Returns how many were dropped.
    async fn cancel_pending(
        &self,
        matches: &(dyn for<'a> Fn(&'a SyncJob) -> bool + Send + Sync),
    ) -> Result<usize, SyncError>;

    /// Jobs queued, delayed, or currently executing.
    async fn active_count(&self) -> usize;

    /// Stop accepting and dispatching work. Pending jobs are discarded;
    /// running jobs finish. Idempotent.
    async fn close(&self);
}

// ─── In-process queue ─────────────────────────────────────────────────────────

const DEFAULT_JOB_BACKOFF: Duration = Duration::from_secs(5);

struct QueueInner {
    ready: VecDeque<(SyncJob, JobOptions)>,
    delayed: Vec<(SyncJob, JobOptions, tokio::time::Instant)>,
    closed: bool,
}

enum NextStep {
    Job(SyncJob, JobOptions),
    Wait(Option<tokio::time::Instant>),
    Shutdown,
}

/// Tokio-task-backed queue for single-process deployments.
///
/// Workers pull jobs off a shared list; per-job retry honors the
/// `max_attempts`/`backoff` options with which the job was enqueued.
pub struct InProcessQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    running: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                ready: VecDeque::new(),
                delayed: Vec::new(),
                closed: false,
            }),
            notify: Notify::new(),
            running: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `workers` tasks that pull jobs and hand them to `runner`.
    pub fn start(self: &Arc<Self>, workers: usize, runner: Arc<dyn JobRunner>) {
        let workers = workers.max(1);
        let mut handles = self.workers.lock().unwrap();
        for id in 0..workers {
            let queue = Arc::clone(self);
            let runner = Arc::clone(&runner);
            handles.push(tokio::spawn(async move {
                queue.worker_loop(id, runner).await;
            }));
        }
        tracing::debug!(workers, "queue workers started");
    }

    /// Wait for all worker tasks to exit. Call after [`WorkQueue::close`].
    pub async fn join(&self) {
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        futures::future::join_all(handles).await;
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    async fn worker_loop(self: Arc<Self>, id: usize, runner: Arc<dyn JobRunner>) {
        loop {
            match self.next_step() {
                NextStep::Job(job, opts) => {
                    self.execute(&job, &opts, runner.as_ref()).await;
                    self.running.fetch_sub(1, Ordering::SeqCst);
                }
                NextStep::Wait(Some(deadline)) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                NextStep::Wait(None) => self.notify.notified().await,
                NextStep::Shutdown => break,
            }
        }
        tracing::debug!(worker = id, "queue worker stopped");
    }

    /// Pop the next runnable job, promoting delayed jobs that have come due.
    /// `running` is incremented under the same lock as the pop so
    /// `active_count` never observes the hand-off gap.
    fn next_step(&self) -> NextStep {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return NextStep::Shutdown;
        }
        let now = tokio::time::Instant::now();
        let mut i = 0;
        while i < inner.delayed.len() {
            if inner.delayed[i].2 <= now {
                let (job, opts, _) = inner.delayed.remove(i);
                inner.ready.push_back((job, opts));
            } else {
                i += 1;
            }
        }
        if let Some((job, opts)) = inner.ready.pop_front() {
            self.running.fetch_add(1, Ordering::SeqCst);
            return NextStep::Job(job, opts);
        }
        NextStep::Wait(inner.delayed.iter().map(|d| d.2).min())
    }

    async fn execute(&self, job: &SyncJob, opts: &JobOptions, runner: &dyn JobRunner) {
        let max_attempts = opts.max_attempts.unwrap_or(1).max(1);
        let backoff = opts.backoff.unwrap_or(DEFAULT_JOB_BACKOFF);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match runner.run(job).await {
                Ok(()) => return,
                Err(err) => {
                    if attempt >= max_attempts {
                        tracing::error!(
                            kind = job.kind(),
                            address = %job.address(),
                            chain_id = job.chain_id(),
                            attempts = attempt,
                            error = %err,
                            "job failed permanently"
                        );
                        return;
                    }
                    let delay = backoff * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        kind = job.kind(),
                        address = %job.address(),
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "job attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if self.is_closed() {
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl WorkQueue for InProcessQueue {
    async fn enqueue(&self, job: SyncJob, opts: JobOptions) -> Result<(), SyncError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(SyncError::QueueClosed);
            }
            match opts.delay {
                Some(delay) if !delay.is_zero() => {
                    let ready_at = tokio::time::Instant::now() + delay;
                    inner.delayed.push((job, opts, ready_at));
                }
                _ => inner.ready.push_back((job, opts)),
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn cancel_pending(
        &self,
        matches: &(dyn for<'a> Fn(&'a SyncJob) -> bool + Send + Sync),
    ) -> Result<usize, SyncError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.ready.len() + inner.delayed.len();
        inner.ready.retain(|(job, _)| !matches(job));
        inner.delayed.retain(|(job, _, _)| !matches(job));
        Ok(before - inner.ready.len() - inner.delayed.len())
    }

    async fn active_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.ready.len() + inner.delayed.len() + self.running.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            inner.ready.clear();
            inner.delayed.clear();
        }
        self.notify.notify_waiters();
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
