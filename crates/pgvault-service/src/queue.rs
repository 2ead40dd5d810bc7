// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! The persistent, priority-ordered job queue.
//!
//! The `jobs` table is the queue of record; the bounded in-memory channel in
//! front of it is only a latency optimisation. `add_job` persists the row
//! *before* attempting the local hand-off, so losing the in-memory slot can
//! never lose a job: a loader in this or any other worker process will
//! observe the row on its next tick.
//!
//! At-most-once execution rests on a single idiom: the conditional
//! `UPDATE jobs SET status = 'running' … WHERE id = … AND status = …` whose
//! affected-row count is the claim decision. The database row transition is
//! the serialisation point across all processes; there is no other lock.
//!
//! A queue that is constructed but never started (the API process) acts as a
//! pure producer: `add_job` persists and returns without touching the
//! channel.

mod loader;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use anyhow::bail;
use futures::future::join_all;
use pgvault_core::{priority, Cadence, JobType};
use prometheus::Registry;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    common::metrics::QueueMetricSet,
    db::{
        models::{self, Job, JobPayload},
        DbPool, PoolError,
    },
    logs::DbLogWriter,
    worker::{Worker, WorkerContext, WorkerStatus, WorkerStatusCell},
};

/// Capacity of the local hand-off channel.
pub(crate) const JOB_CHANNEL_CAPACITY: usize = 1000;

/// How many eligible rows one loader tick claims at most.
pub(crate) const LOADER_BATCH_SIZE: i64 = 10;

/// Period of the database loader.
pub(crate) const LOADER_INTERVAL: Duration = Duration::from_secs(5);

/// Period of the statistics refresher.
pub(crate) const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// A job `running` for longer than this without finishing is considered
/// orphaned by a dead worker and becomes reclaimable.
pub(crate) const STALE_RUNNING_AFTER: Duration = Duration::from_secs(5 * 60);

/// Base and cap of the retry backoff: a `retrying` row becomes eligible
/// `min(CAP, BASE × 2^retry_count)` seconds after its last attempt.
pub(crate) const RETRY_BACKOFF_BASE_SECS: u64 = 15;
pub(crate) const RETRY_BACKOFF_CAP_SECS: u64 = 300;

/// How long `stop` waits for in-flight jobs before terminating the workers.
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// The backoff delay before a job with `retry_count` failed attempts is
/// re-observed. Mirrors the interval arithmetic in the loader's eligibility
/// query; keep the two in sync.
pub(crate) fn retry_backoff(retry_count: i32) -> Duration {
    let exp = retry_count.clamp(0, 31) as u32;
    let secs = RETRY_BACKOFF_BASE_SECS
        .saturating_mul(1u64 << exp)
        .min(RETRY_BACKOFF_CAP_SECS);
    Duration::from_secs(secs)
}

/// Producer-side enqueue failure.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The local buffer is saturated. The job row has already been
    /// persisted and will be picked up by a loader.
    #[error("job queue is full")]
    QueueFull,
    /// The queue is shutting down.
    #[error("job queue is shutting down")]
    ShuttingDown,
    /// Persisting the job row failed; the job does not exist.
    #[error("failed to persist job: {0}")]
    Database(String),
}

impl From<diesel::result::Error> for EnqueueError {
    fn from(error: diesel::result::Error) -> Self {
        Self::Database(error.to_string())
    }
}

impl From<PoolError> for EnqueueError {
    fn from(error: PoolError) -> Self {
        Self::Database(error.to_string())
    }
}

/// Snapshot of queue statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub total_jobs: i64,
    pub pending_jobs: i64,
    pub running_jobs: i64,
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    pub active_workers: usize,
}

/// A job travelling through the local channel.
///
/// `claimed` records whether the loader already performed the database claim
/// transition. Directly enqueued jobs are unclaimed; the consuming worker
/// must win the claim itself before executing.
#[derive(Debug)]
pub(crate) struct QueuedJob {
    pub(crate) job: Job,
    pub(crate) claimed: bool,
}

pub(crate) struct QueueInner {
    pub(crate) pool: DbPool,
    pub(crate) tx: async_channel::Sender<QueuedJob>,
    pub(crate) rx: async_channel::Receiver<QueuedJob>,
    pub(crate) cancel: CancellationToken,
    pub(crate) metrics: QueueMetricSet,
    pub(crate) log: DbLogWriter,
    running: AtomicBool,
    stats: RwLock<QueueStats>,
    worker_states: RwLock<Vec<WorkerStatusCell>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    worker_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Durable, priority-ordered, at-most-once job queue. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("running", &self.is_running())
            .field("buffered", &self.inner.rx.len())
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(pool: DbPool, registry: &Registry) -> Self {
        let (tx, rx) = async_channel::bounded(JOB_CHANNEL_CAPACITY);
        let log = DbLogWriter::new(pool.clone(), "QUEUE");
        Self {
            inner: Arc::new(QueueInner {
                pool,
                tx,
                rx,
                cancel: CancellationToken::new(),
                metrics: QueueMetricSet::new(registry),
                log,
                running: AtomicBool::new(false),
                stats: RwLock::new(QueueStats::default()),
                worker_states: RwLock::new(Vec::new()),
                tasks: std::sync::Mutex::new(Vec::new()),
                worker_tasks: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Persists a new job and attempts the non-blocking local hand-off.
    ///
    /// The persist happens first and is mandatory; a [`EnqueueError::QueueFull`]
    /// therefore means "accepted but not buffered locally", not "lost".
    pub async fn add_job(&self, job: Job) -> Result<Job, EnqueueError> {
        {
            let mut conn = self.inner.pool.get().await?;
            models::insert_job(&mut conn, &job).await?;
        }
        tracing::debug!(job_id = %job.id, job_type = %job.job_type, "persisted job");

        if !self.is_running() {
            // Pure producer: a loader in a worker process picks the row up.
            return Ok(job);
        }
        if self.inner.cancel.is_cancelled() {
            return Err(EnqueueError::ShuttingDown);
        }

        match self.inner.tx.try_send(QueuedJob {
            job: job.clone(),
            claimed: false,
        }) {
            Ok(()) => {
                self.inner
                    .log
                    .job_progress(&job.id, None, &format!("Job {} ({}) added to queue", job.id, job.job_type))
                    .await;
                Ok(job)
            }
            Err(async_channel::TrySendError::Full(_)) => Err(EnqueueError::QueueFull),
            Err(async_channel::TrySendError::Closed(_)) => Err(EnqueueError::ShuttingDown),
        }
    }

    /// Enqueues a backup job. `backup_id` refers to the pre-created backup
    /// row when the producer made one; without it the worker creates the row.
    pub async fn add_backup_job(
        &self,
        instance_id: &str,
        database_name: &str,
        cadence: Cadence,
        backup_id: Option<&str>,
        priority: i32,
    ) -> Result<Job, EnqueueError> {
        let payload = JobPayload::backup(instance_id, database_name, cadence, backup_id);
        self.add_job(Job::new(JobType::Backup, &payload, priority)).await
    }

    /// Enqueues a restore job. Restores never retry automatically.
    pub async fn add_restore_job(
        &self,
        backup_id: &str,
        instance_id: &str,
        database_name: &str,
        priority: i32,
    ) -> Result<Job, EnqueueError> {
        let payload = JobPayload::restore(backup_id, instance_id, database_name);
        self.add_job(Job::new(JobType::Restore, &payload, priority)).await
    }

    /// Enqueues a retention cleanup job for one `(instance, cadence)` pair.
    pub async fn add_cleanup_job(
        &self,
        instance_id: &str,
        cadence: Cadence,
    ) -> Result<Job, EnqueueError> {
        let payload = JobPayload::cleanup(instance_id, cadence);
        self.add_job(Job::new(JobType::Cleanup, &payload, priority::CLEANUP))
            .await
    }

    /// The current statistics snapshot, as maintained by the refresher.
    pub fn stats(&self) -> QueueStats {
        self.inner.stats.read().expect("stats lock poisoned").clone()
    }

    /// Status snapshots of all workers.
    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        self.inner
            .worker_states
            .read()
            .expect("worker state lock poisoned")
            .iter()
            .map(|cell| cell.snapshot())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Starts `worker_count` workers plus the loader and stats background
    /// loops.
    pub async fn start(&self, ctx: WorkerContext, worker_count: usize) -> anyhow::Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            bail!("queue is already running");
        }

        let mut worker_tasks = Vec::with_capacity(worker_count);
        let mut states = Vec::with_capacity(worker_count);
        for index in 1..=worker_count {
            let worker = Worker::new(index, ctx.clone());
            states.push(worker.status_cell());
            worker_tasks.push(worker.spawn(self.inner.rx.clone()));
        }
        *self
            .inner
            .worker_states
            .write()
            .expect("worker state lock poisoned") = states;
        *self
            .inner
            .worker_tasks
            .lock()
            .expect("worker task lock poisoned") = worker_tasks;

        let tasks = vec![
            tokio::spawn(loader::run_loader(self.inner.clone())),
            tokio::spawn(run_stats_refresher(self.inner.clone())),
        ];
        *self.inner.tasks.lock().expect("task lock poisoned") = tasks;

        self.inner
            .log
            .info(&format!("Queue started with {worker_count} workers"))
            .await;
        Ok(())
    }

    /// Stops the queue: halts the loader, lets in-flight jobs finish within
    /// the grace period, then terminates the remaining workers.
    ///
    /// Jobs terminated this way stay `running` in the database and are
    /// reclaimed by the staleness window in another process.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.cancel.cancel();
        self.inner.tx.close();

        let background = std::mem::take(
            &mut *self.inner.tasks.lock().expect("task lock poisoned"),
        );
        join_all(background).await;

        let workers = std::mem::take(
            &mut *self
                .inner
                .worker_tasks
                .lock()
                .expect("worker task lock poisoned"),
        );
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for mut handle in workers {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                // Aborting the task drops any in-flight pg_dump/psql child,
                // which is spawned kill-on-drop; the job row stays `running`
                // and is reclaimed via the staleness window.
                tracing::warn!(grace = ?SHUTDOWN_GRACE, "worker still busy after grace period; terminating");
                handle.abort();
                let _ = handle.await;
            }
        }

        self.inner.log.info("Queue stopped").await;
    }
}

async fn run_stats_refresher(inner: Arc<QueueInner>) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        refresh_stats(&inner).await;
    }
}

async fn refresh_stats(inner: &Arc<QueueInner>) {
    let mut stats = inner.stats.read().expect("stats lock poisoned").clone();

    match job_counts(inner).await {
        Ok(counts) => {
            stats.total_jobs = counts.iter().map(|(_, n)| n).sum();
            stats.completed_jobs = count_of(&counts, "completed");
            stats.failed_jobs = count_of(&counts, "failed");
        }
        Err(error) => {
            tracing::warn!(?error, "failed to refresh job counts; keeping last values");
        }
    }

    // Pending is the local channel depth, running the number of busy
    // workers; both are process-local by design.
    stats.pending_jobs = inner.rx.len() as i64;
    let busy = inner
        .worker_states
        .read()
        .expect("worker state lock poisoned")
        .iter()
        .filter(|cell| cell.is_active())
        .count();
    stats.running_jobs = busy as i64;
    stats.active_workers = busy;

    inner.metrics.queue_depth.set(stats.pending_jobs);
    *inner.stats.write().expect("stats lock poisoned") = stats;
}

async fn job_counts(inner: &Arc<QueueInner>) -> anyhow::Result<Vec<(String, i64)>> {
    let mut conn = inner.pool.get().await?;
    Ok(models::count_jobs_by_status(&mut conn).await?)
}

fn count_of(counts: &[(String, i64)], status: &str) -> i64 {
    counts
        .iter()
        .find(|(s, _)| s.as_str() == status)
        .map(|(_, n)| *n)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use pgvault_test_utils::param_test;

    use super::*;

    param_test! {
        backoff_is_capped_exponential: [
            first_retry: (0, 15),
            second_retry: (1, 30),
            third_retry: (2, 60),
            fourth_retry: (3, 120),
            fifth_retry: (4, 240),
            capped: (5, 300),
            deep_retry_stays_capped: (30, 300),
            negative_is_clamped: (-1, 15),
        ]
    }
    fn backoff_is_capped_exponential(retry_count: i32, expected_secs: u64) {
        assert_eq!(retry_backoff(retry_count), Duration::from_secs(expected_secs));
    }

    #[test]
    fn count_of_missing_status_is_zero() {
        let counts = vec![("completed".to_owned(), 3)];
        assert_eq!(count_of(&counts, "completed"), 3);
        assert_eq!(count_of(&counts, "failed"), 0);
    }
}
