// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Retention cleanup over one `(instance, cadence)` object-store prefix.
//!
//! The prefix listing is chronological by key construction, so the keys to
//! delete are simply the front of the list. Per-object delete failures are
//! logged and counted but never fail the job; a failing store must not
//! block retention for every other prefix.

use pgvault_core::keys;

use super::{JobError, WorkerContext};
use crate::{
    db::models::{Job, JobPayload},
    storage,
};

pub(super) async fn run(ctx: &WorkerContext, job: &Job, payload: &JobPayload) -> Result<(), JobError> {
    let instance_id = payload
        .instance_id
        .as_deref()
        .ok_or_else(|| JobError::Payload("missing instance_id".to_owned()))?;
    let cadence = payload
        .cadence
        .ok_or_else(|| JobError::Payload("missing cadence".to_owned()))?;

    ctx.log
        .job_progress(
            &job.id,
            None,
            &format!("Cleanup started for {instance_id} ({cadence})"),
        )
        .await;

    let Some(keep) = ctx.retention.for_cadence(cadence) else {
        // Covers the manual cadence too: manual backups are exempt.
        ctx.log
            .job_progress(
                &job.id,
                None,
                &format!("Retention not configured for {cadence}, nothing to do"),
            )
            .await;
        return Ok(());
    };

    let prefix = keys::cadence_prefix(instance_id, cadence);
    let listed = ctx.store.list(&prefix).await?;
    let excess = storage::excess_keys(&listed, keep as usize);

    if excess.is_empty() {
        ctx.log
            .job_progress(
                &job.id,
                None,
                &format!(
                    "Retention satisfied: {} objects under {prefix}, keeping {keep}",
                    listed.len()
                ),
            )
            .await;
        return Ok(());
    }

    let mut deleted = 0usize;
    let mut failed = 0usize;
    for key in excess {
        match ctx.store.delete(key).await {
            Ok(()) => deleted += 1,
            Err(error) => {
                failed += 1;
                ctx.log
                    .job_warn(&job.id, None, &format!("Failed to delete old backup {key}: {error}"))
                    .await;
            }
        }
    }

    let summary = format!("Cleanup finished: deleted {deleted}, failed {failed}");
    if failed > 0 {
        ctx.log.job_warn(&job.id, None, &summary).await;
    } else {
        ctx.log.job_progress(&job.id, None, &summary).await;
    }
    Ok(())
}
