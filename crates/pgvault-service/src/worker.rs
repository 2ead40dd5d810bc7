// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! The worker pool: consumes jobs from the queue's local channel, drives the
//! per-type pipelines, and writes terminal state back to the control
//! database.
//!
//! Each worker owns at most one job at a time. A job reaches a worker either
//! already claimed by the loader, or unclaimed via the producer's local
//! hand-off, in which case the worker performs the claim transition itself
//! and silently drops the job when another process has won it.

mod backup;
mod cleanup;
mod pg_tools;
mod restore;

use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use diesel::ExpressionMethods;
use diesel_async::RunQueryDsl;
use pgvault_core::{JobStatus, JobType};
use serde::Serialize;
use tokio::task::JoinHandle;

pub use pg_tools::tool_version;

use crate::{
    common::metrics::WorkerMetricSet,
    config::RetentionPolicy,
    db::{
        models::{self, Job},
        schema::jobs,
        DbPool, PoolError,
    },
    logs::DbLogWriter,
    queue::{retry_backoff, JobQueue, QueuedJob},
    storage::{ArtifactStore, StorageError},
};

/// Error raised by a job handler. The variant decides retry behaviour:
/// [`JobError::NotFound`] and [`JobError::Payload`] fail the job without
/// retry, everything else participates in retry accounting.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// A referenced instance, backup, or job row is missing.
    #[error("{0} not found")]
    NotFound(String),
    /// The job payload is missing fields or malformed.
    #[error("invalid job payload: {0}")]
    Payload(String),
    /// `pg_dump` exited non-zero or could not be spawned.
    #[error("{0}")]
    Dump(String),
    /// `psql` exited non-zero or could not be spawned.
    #[error("{0}")]
    Restore(String),
    /// Temp-directory creation, stat, or delete failure.
    #[error("{0}")]
    Fs(String),
    /// Object-store upload, download, list, or delete failure.
    #[error("object store error: {0}")]
    ObjectStore(String),
    /// Control-database failure. The operation aborts and the job row is
    /// left in its current state for the staleness reaper.
    #[error("control database error: {0}")]
    Database(String),
}

impl JobError {
    /// Whether a failed attempt may be retried.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, JobError::NotFound(_) | JobError::Payload(_))
    }
}

impl From<diesel::result::Error> for JobError {
    fn from(error: diesel::result::Error) -> Self {
        Self::Database(error.to_string())
    }
}

impl From<PoolError> for JobError {
    fn from(error: PoolError) -> Self {
        Self::Database(error.to_string())
    }
}

impl From<StorageError> for JobError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Io(io) => Self::Fs(io.to_string()),
            StorageError::ObjectStore(inner) => Self::ObjectStore(inner.to_string()),
        }
    }
}

/// Everything a worker needs besides the job itself.
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: DbPool,
    /// Used to schedule retention cleanup after successful backups.
    pub queue: JobQueue,
    pub store: ArtifactStore,
    pub temp_dir: PathBuf,
    pub retention: RetentionPolicy,
    pub log: DbLogWriter,
    pub metrics: WorkerMetricSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerPhase {
    Idle,
    Working,
    Stopped,
}

impl WorkerPhase {
    fn as_str(&self) -> &'static str {
        match self {
            WorkerPhase::Idle => "idle",
            WorkerPhase::Working => "working",
            WorkerPhase::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
struct WorkerState {
    id: String,
    phase: WorkerPhase,
    current_job: Option<String>,
    jobs_handled: u64,
    started_at: DateTime<Utc>,
    last_job_at: Option<DateTime<Utc>>,
}

/// Externally visible snapshot of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: String,
    pub status: &'static str,
    pub current_job_id: Option<String>,
    pub jobs_handled: u64,
    pub started_at: DateTime<Utc>,
    pub last_job_at: Option<DateTime<Utc>>,
}

/// Shared handle onto a worker's state, read by the queue's statistics and
/// the admin API. Writers hold the lock only for field updates.
#[derive(Clone)]
pub(crate) struct WorkerStatusCell(Arc<RwLock<WorkerState>>);

impl WorkerStatusCell {
    fn new(id: String) -> Self {
        Self(Arc::new(RwLock::new(WorkerState {
            id,
            phase: WorkerPhase::Idle,
            current_job: None,
            jobs_handled: 0,
            started_at: Utc::now(),
            last_job_at: None,
        })))
    }

    pub(crate) fn snapshot(&self) -> WorkerStatus {
        let state = self.0.read().expect("worker state lock poisoned");
        WorkerStatus {
            id: state.id.clone(),
            status: state.phase.as_str(),
            current_job_id: state.current_job.clone(),
            jobs_handled: state.jobs_handled,
            started_at: state.started_at,
            last_job_at: state.last_job_at,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        let state = self.0.read().expect("worker state lock poisoned");
        state.phase == WorkerPhase::Working && state.current_job.is_some()
    }

    fn begin_job(&self, job_id: &str) {
        let mut state = self.0.write().expect("worker state lock poisoned");
        state.phase = WorkerPhase::Working;
        state.current_job = Some(job_id.to_owned());
    }

    fn end_job(&self) {
        let mut state = self.0.write().expect("worker state lock poisoned");
        state.phase = WorkerPhase::Idle;
        state.current_job = None;
        state.jobs_handled += 1;
        state.last_job_at = Some(Utc::now());
    }

    fn stop(&self) {
        let mut state = self.0.write().expect("worker state lock poisoned");
        state.phase = WorkerPhase::Stopped;
        state.current_job = None;
    }
}

/// One worker in the pool.
pub(crate) struct Worker {
    id: String,
    state: WorkerStatusCell,
    ctx: WorkerContext,
}

impl Worker {
    pub(crate) fn new(index: usize, ctx: WorkerContext) -> Self {
        let id = format!("worker-{index}");
        Self {
            state: WorkerStatusCell::new(id.clone()),
            id,
            ctx,
        }
    }

    pub(crate) fn status_cell(&self) -> WorkerStatusCell {
        self.state.clone()
    }

    pub(crate) fn spawn(self, rx: async_channel::Receiver<QueuedJob>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    async fn run(self, rx: async_channel::Receiver<QueuedJob>) {
        tracing::info!(worker = %self.id, "worker started");
        while let Ok(queued) = rx.recv().await {
            self.process(queued).await;
        }
        self.state.stop();
        tracing::info!(worker = %self.id, "worker stopped: job channel closed");
    }

    async fn process(&self, queued: QueuedJob) {
        let job = queued.job;

        if !queued.claimed {
            match self.claim_direct(&job.id).await {
                Ok(true) => {}
                Ok(false) => {
                    // Another process won between persist and hand-off.
                    tracing::debug!(job_id = %job.id, "lost direct claim; skipping");
                    return;
                }
                Err(error) => {
                    tracing::warn!(job_id = %job.id, ?error, "direct claim failed; leaving job to the loader");
                    return;
                }
            }
        }

        self.record_worker_id(&job.id).await;
        self.state.begin_job(&job.id);
        self.ctx.metrics.active_workers.inc();
        self.ctx
            .log
            .job_progress(
                &job.id,
                None,
                &format!("Worker {} processing job {} ({})", self.id, job.id, job.job_type),
            )
            .await;

        let result = self.dispatch(&job).await;
        self.finish(&job, result).await;

        self.ctx.metrics.active_workers.dec();
        self.state.end_job();
    }

    async fn dispatch(&self, job: &Job) -> Result<(), JobError> {
        let payload = job
            .payload()
            .map_err(|error| JobError::Payload(error.to_string()))?;
        match job.job_type() {
            Some(JobType::Backup) => backup::run(&self.ctx, job, &payload).await,
            Some(JobType::Restore) => restore::run(&self.ctx, job, &payload).await,
            Some(JobType::Cleanup) => cleanup::run(&self.ctx, job, &payload).await,
            None => Err(JobError::Payload(format!(
                "unknown job type: {}",
                job.job_type
            ))),
        }
    }

    /// Writes the attempt's outcome to the job row. Retry accounting: a
    /// retriable error with remaining budget marks the row `retrying` for
    /// the loader to re-observe after backoff; otherwise the job fails.
    async fn finish(&self, job: &Job, result: Result<(), JobError>) {
        let job_type = job.job_type.as_str();
        let (status, retry_count, error_message) = match &result {
            Ok(()) => {
                // Component-level line, deliberately untagged: the job-tagged
                // sequence ends with the handler's own final progress line.
                self.ctx
                    .log
                    .info(&format!(
                        "Worker {}: job {} completed successfully",
                        self.id, job.id
                    ))
                    .await;
                self.ctx
                    .metrics
                    .jobs_processed
                    .with_label_values(&[job_type, "completed"])
                    .inc();
                (JobStatus::Completed, job.retry_count, None)
            }
            Err(error) => {
                let attempts = (job.retry_count + 1).min(job.max_retries);
                if error.is_retriable() && attempts < job.max_retries {
                    let delay = retry_backoff(attempts);
                    self.ctx
                        .log
                        .job_warn(
                            &job.id,
                            None,
                            &format!(
                                "Job {} failed, will retry in ~{}s ({}/{}): {error}",
                                job.id,
                                delay.as_secs(),
                                attempts,
                                job.max_retries,
                            ),
                        )
                        .await;
                    self.ctx
                        .metrics
                        .jobs_processed
                        .with_label_values(&[job_type, "retrying"])
                        .inc();
                    (JobStatus::Retrying, attempts, Some(error.to_string()))
                } else {
                    self.ctx
                        .log
                        .append(
                            crate::logs::LogLevel::Error,
                            Some(&job.id),
                            None,
                            &format!(
                                "Job {} failed permanently after {attempts} attempts: {error}",
                                job.id,
                            ),
                            None,
                        )
                        .await;
                    self.ctx
                        .metrics
                        .jobs_processed
                        .with_label_values(&[job_type, "failed"])
                        .inc();
                    (JobStatus::Failed, attempts, Some(error.to_string()))
                }
            }
        };

        let written: Result<(), JobError> = async {
            let mut conn = self.ctx.pool.get().await?;
            models::finish_job(
                &mut conn,
                &job.id,
                status,
                retry_count,
                error_message.as_deref(),
            )
            .await?;
            Ok(())
        }
        .await;

        if let Err(error) = written {
            // The row stays `running`; the staleness reaper recovers it in
            // another process.
            tracing::error!(job_id = %job.id, ?error, "failed to write terminal job state");
        }
    }

    /// Claim transition for directly enqueued (not loader-claimed) jobs.
    async fn claim_direct(&self, job_id: &str) -> Result<bool, JobError> {
        let mut conn = self.ctx.pool.get().await?;
        let affected = diesel::update(jobs::table)
            .filter(jobs::id.eq(job_id))
            .filter(jobs::status.eq(JobStatus::Pending.as_str()))
            .set((
                jobs::status.eq(JobStatus::Running.as_str()),
                jobs::started_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(affected == 1)
    }

    /// Records the executing worker on the job row. Diagnostics only.
    async fn record_worker_id(&self, job_id: &str) {
        let result: Result<(), JobError> = async {
            let mut conn = self.ctx.pool.get().await?;
            models::set_job_worker(&mut conn, job_id, &self.id).await?;
            Ok(())
        }
        .await;
        if let Err(error) = result {
            tracing::debug!(job_id, ?error, "failed to record worker id");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_state_snapshot_transitions() {
        let cell = WorkerStatusCell::new("worker-1".to_owned());
        let snapshot = cell.snapshot();
        assert_eq!(snapshot.status, "idle");
        assert_eq!(snapshot.jobs_handled, 0);
        assert!(!cell.is_active());

        cell.begin_job("job_a");
        assert!(cell.is_active());
        assert_eq!(cell.snapshot().current_job_id.as_deref(), Some("job_a"));

        cell.end_job();
        let snapshot = cell.snapshot();
        assert_eq!(snapshot.status, "idle");
        assert_eq!(snapshot.current_job_id, None);
        assert_eq!(snapshot.jobs_handled, 1);
        assert!(snapshot.last_job_at.is_some());

        cell.stop();
        assert_eq!(cell.snapshot().status, "stopped");
    }

    #[test]
    fn not_found_and_payload_errors_do_not_retry() {
        assert!(!JobError::NotFound("instance pg1".into()).is_retriable());
        assert!(!JobError::Payload("missing instance_id".into()).is_retriable());
        assert!(JobError::Dump("pg_dump failed".into()).is_retriable());
        assert!(JobError::ObjectStore("upload".into()).is_retriable());
        assert!(JobError::Database("closed".into()).is_retriable());
    }
}
