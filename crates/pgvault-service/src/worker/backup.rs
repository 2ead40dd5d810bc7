// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! The backup pipeline: resolve → dump → stat → upload → finalize.
//!
//! The backup row is the durable progress record. Every failure path writes
//! the failure onto the row (status, end_time, error_message) before
//! returning the error to the queue's retry accounting, so an operator can
//! always see how far an attempt got.

use chrono::Utc;
use pgvault_core::{keys, BackupStatus, Cadence};

use super::{pg_tools, JobError, WorkerContext};
use crate::db::models::{self, Backup, Job, JobPayload};

pub(super) async fn run(ctx: &WorkerContext, job: &Job, payload: &JobPayload) -> Result<(), JobError> {
    let instance_id = payload
        .instance_id
        .as_deref()
        .ok_or_else(|| JobError::Payload("missing instance_id".to_owned()))?;
    let database = payload
        .database_name
        .as_deref()
        .ok_or_else(|| JobError::Payload("missing database_name".to_owned()))?;
    let cadence = payload.cadence.unwrap_or(Cadence::Manual);

    // Resolve the backup row: reuse the producer's pending row when the
    // payload carries one (retries and scheduler-created jobs do), create
    // one otherwise.
    let mut backup = match payload.backup_id.as_deref().filter(|id| !id.is_empty()) {
        Some(backup_id) => {
            let mut conn = ctx.pool.get().await?;
            let backup = models::get_backup(&mut conn, backup_id)
                .await?
                .ok_or_else(|| JobError::NotFound(format!("backup {backup_id}")))?;
            ctx.log
                .job_progress(
                    &job.id,
                    Some(&backup.id),
                    &format!("Using existing backup record {}", backup.id),
                )
                .await;
            backup
        }
        None => {
            let backup = Backup::new_pending(instance_id, database, cadence);
            let mut conn = ctx.pool.get().await?;
            models::insert_backup(&mut conn, &backup).await?;
            ctx.log
                .job_progress(
                    &job.id,
                    Some(&backup.id),
                    &format!("Created new backup record {}", backup.id),
                )
                .await;
            backup
        }
    };
    backup.job_id = Some(job.id.clone());

    ctx.log
        .job_progress(
            &job.id,
            Some(&backup.id),
            &format!("Backup started for {instance_id}/{database}"),
        )
        .await;

    backup.set_status(BackupStatus::InProgress);
    backup.start_time = Utc::now();
    // A retried attempt reuses a row that may carry a previous failure;
    // end_time is only set on terminal states.
    backup.end_time = None;
    backup.error_message = None;
    persist(ctx, &backup).await?;
    ctx.log
        .job_progress(&job.id, Some(&backup.id), "Status: IN_PROGRESS")
        .await;

    // Instances change rarely; a fresh read per job is cheap and avoids a
    // cache that could serve stale credentials.
    let instance = {
        let mut conn = ctx.pool.get().await?;
        models::get_instance(&mut conn, instance_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("instance {instance_id}")))?
    };

    tokio::fs::create_dir_all(&ctx.temp_dir)
        .await
        .map_err(|error| JobError::Fs(format!("failed to create temp directory: {error}")))?;

    let filename = keys::dump_filename(&instance.name, database, cadence, backup.start_time);
    let local_path = ctx.temp_dir.join(&filename);
    ctx.log
        .job_progress(
            &job.id,
            Some(&backup.id),
            &format!("Local file: {}", local_path.display()),
        )
        .await;

    if let Some(version) = pg_tools::tool_version("pg_dump").await {
        ctx.log
            .job_progress(&job.id, Some(&backup.id), &format!("pg_dump version: {version}"))
            .await;
    }
    ctx.log
        .job_progress(
            &job.id,
            Some(&backup.id),
            &format!(
                "Executing pg_dump: {}@{}:{}/{}",
                instance.username, instance.host, instance.port, database
            ),
        )
        .await;

    let dump_timer = std::time::Instant::now();
    let dump_result = pg_tools::run_pg_dump(&instance, database, &local_path).await;
    ctx.metrics
        .dump_duration
        .observe(dump_timer.elapsed().as_secs_f64());

    if let Err(failure) = dump_result {
        let message = format!(
            "pg_dump failed: {}\nOutput: {}",
            failure.summary, failure.output
        );
        fail_backup(ctx, job, &mut backup, message).await?;
        return Err(JobError::Dump(format!("pg_dump failed: {}", failure.summary)));
    }
    ctx.log
        .job_progress(&job.id, Some(&backup.id), "pg_dump completed successfully")
        .await;

    let metadata = match tokio::fs::metadata(&local_path).await {
        Ok(metadata) => metadata,
        Err(error) => {
            fail_backup(ctx, job, &mut backup, format!("failed to get file info: {error}")).await?;
            return Err(JobError::Fs("failed to get file info".to_owned()));
        }
    };
    backup.file_size = metadata.len() as i64;
    backup.file_path = Some(local_path.display().to_string());
    ctx.log
        .job_progress(
            &job.id,
            Some(&backup.id),
            &format!("File size: {} bytes", backup.file_size),
        )
        .await;

    let key = keys::object_key(instance_id, cadence, backup.start_time, &filename);
    ctx.log
        .job_progress(&job.id, Some(&backup.id), &format!("Object key: {key}"))
        .await;

    ctx.log
        .job_progress(&job.id, Some(&backup.id), "Starting object store upload...")
        .await;
    let upload_timer = std::time::Instant::now();
    let upload_result = ctx.store.upload_file(&local_path, &key).await;
    ctx.metrics
        .upload_duration
        .observe(upload_timer.elapsed().as_secs_f64());
    if let Err(error) = upload_result {
        fail_backup(ctx, job, &mut backup, format!("upload failed: {error}")).await?;
        return Err(error.into());
    }
    // Only a completed backup carries an object key; no object exists at
    // the key until the upload has succeeded.
    backup.object_key = Some(key);
    ctx.metrics.bytes_uploaded.inc_by(backup.file_size as u64);
    ctx.log
        .job_progress(&job.id, Some(&backup.id), "Object store upload completed successfully")
        .await;

    match tokio::fs::remove_file(&local_path).await {
        Ok(()) => {
            // The artifact now lives in the object store; stop advertising
            // a local path that no longer exists.
            backup.file_path = None;
        }
        Err(error) => {
            ctx.log
                .job_warn(
                    &job.id,
                    Some(&backup.id),
                    &format!("Failed to remove local dump file: {error}"),
                )
                .await;
        }
    }

    backup.set_status(BackupStatus::Completed);
    backup.end_time = Some(Utc::now());
    backup.error_message = None;
    persist(ctx, &backup).await?;
    ctx.log
        .job_progress(&job.id, Some(&backup.id), "Backup completed successfully")
        .await;

    schedule_retention(ctx, job, &backup, instance_id, cadence).await;
    Ok(())
}

/// Enqueues the retention cleanup for `(instance, cadence)` if retention is
/// configured. Never fails the backup: the artifact is already safe.
async fn schedule_retention(
    ctx: &WorkerContext,
    job: &Job,
    backup: &Backup,
    instance_id: &str,
    cadence: Cadence,
) {
    if ctx.retention.for_cadence(cadence).is_none() {
        return;
    }
    match ctx.queue.add_cleanup_job(instance_id, cadence).await {
        Ok(cleanup) => {
            ctx.log
                .job_progress(
                    &job.id,
                    Some(&backup.id),
                    &format!("Scheduled retention cleanup job {}", cleanup.id),
                )
                .await;
        }
        Err(crate::queue::EnqueueError::QueueFull) => {
            // Persisted; a loader will pick it up.
            ctx.log
                .job_progress(
                    &job.id,
                    Some(&backup.id),
                    "Retention cleanup persisted; local queue full",
                )
                .await;
        }
        Err(error) => {
            ctx.log
                .job_warn(
                    &job.id,
                    Some(&backup.id),
                    &format!("Failed to schedule retention cleanup: {error}"),
                )
                .await;
        }
    }
}

/// Marks the backup failed with `message` and persists it, logging the
/// failure against the job.
async fn fail_backup(
    ctx: &WorkerContext,
    job: &Job,
    backup: &mut Backup,
    message: String,
) -> Result<(), JobError> {
    backup.set_status(BackupStatus::Failed);
    backup.error_message = Some(message.clone());
    backup.end_time = Some(Utc::now());
    // A key is only set once an object exists at it.
    backup.object_key = None;
    persist(ctx, backup).await?;
    ctx.log
        .append(
            crate::logs::LogLevel::Error,
            Some(&job.id),
            Some(&backup.id),
            &message,
            None,
        )
        .await;
    Ok(())
}

async fn persist(ctx: &WorkerContext, backup: &Backup) -> Result<(), JobError> {
    let mut conn = ctx.pool.get().await?;
    models::update_backup(&mut conn, backup).await?;
    Ok(())
}
