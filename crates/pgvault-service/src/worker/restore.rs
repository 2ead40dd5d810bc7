// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! The restore pipeline: download the artifact, feed it to `psql`, and
//! clean the temp file up on every exit path.

use chrono::Utc;
use pgvault_core::BackupStatus;

use super::{pg_tools, JobError, WorkerContext};
use crate::db::models::{self, Job, JobPayload};

pub(super) async fn run(ctx: &WorkerContext, job: &Job, payload: &JobPayload) -> Result<(), JobError> {
    let backup_id = payload
        .backup_id
        .as_deref()
        .ok_or_else(|| JobError::Payload("missing backup_id".to_owned()))?;
    let instance_id = payload
        .instance_id
        .as_deref()
        .ok_or_else(|| JobError::Payload("missing instance_id".to_owned()))?;
    let database = payload
        .database_name
        .as_deref()
        .ok_or_else(|| JobError::Payload("missing database_name".to_owned()))?;

    ctx.log
        .job_progress(
            &job.id,
            Some(backup_id),
            &format!("Restore started for backup {backup_id} to {instance_id}/{database}"),
        )
        .await;

    let (backup, instance) = {
        let mut conn = ctx.pool.get().await?;
        let backup = models::get_backup(&mut conn, backup_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("backup {backup_id}")))?;
        let instance = models::get_instance(&mut conn, instance_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("instance {instance_id}")))?;
        (backup, instance)
    };

    if backup.status() != Some(BackupStatus::Completed) {
        return Err(JobError::Restore(format!(
            "backup {backup_id} is not completed"
        )));
    }
    let object_key = backup
        .object_key
        .as_deref()
        .ok_or_else(|| JobError::Restore(format!("backup {backup_id} has no stored artifact")))?;

    tokio::fs::create_dir_all(&ctx.temp_dir)
        .await
        .map_err(|error| JobError::Fs(format!("failed to create temp directory: {error}")))?;
    let local_path = ctx
        .temp_dir
        .join(format!("restore_{backup_id}_{}.sql", Utc::now().timestamp()));

    if let Err(error) = ctx.store.download_to_file(object_key, &local_path).await {
        remove_temp(ctx, job, &local_path).await;
        return Err(error.into());
    }
    ctx.log
        .job_progress(
            &job.id,
            Some(backup_id),
            &format!("Downloaded artifact to {}", local_path.display()),
        )
        .await;

    let result = pg_tools::run_psql(&instance, database, &local_path).await;
    remove_temp(ctx, job, &local_path).await;

    match result {
        Ok(_) => {
            ctx.log
                .job_progress(&job.id, Some(backup_id), "Restore completed successfully")
                .await;
            Ok(())
        }
        Err(failure) => {
            ctx.log
                .append(
                    crate::logs::LogLevel::Error,
                    Some(&job.id),
                    Some(backup_id),
                    &format!("psql restore failed: {}", failure.summary),
                    Some(&failure.output),
                )
                .await;
            Err(JobError::Restore(format!(
                "psql restore failed: {}",
                failure.summary
            )))
        }
    }
}

async fn remove_temp(ctx: &WorkerContext, job: &Job, path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => {
            ctx.log
                .job_warn(
                    &job.id,
                    None,
                    &format!("Failed to remove restore temp file: {error}"),
                )
                .await;
        }
    }
}
