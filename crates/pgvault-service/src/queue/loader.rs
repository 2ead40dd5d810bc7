// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! The database loader: moves eligible job rows into the local channel.
//!
//! A row is eligible when it is `pending`, when it is `retrying` and its
//! backoff delay has elapsed, or when it is `running` but its worker went
//! silent for longer than the staleness window (a crashed process). Each
//! eligible row is claimed with a conditional UPDATE keyed on the status the
//! loader observed; only a claim that affects exactly one row may enter the
//! channel. If the channel is full the claim is rolled back so that another
//! process can take the job.

use std::sync::Arc;

use anyhow::Context as _;
use diesel::{sql_query, sql_types::BigInt, QueryableByName};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use super::{
    QueueInner, QueuedJob, LOADER_BATCH_SIZE, LOADER_INTERVAL, RETRY_BACKOFF_BASE_SECS,
    RETRY_BACKOFF_CAP_SECS, STALE_RUNNING_AFTER,
};
use crate::db::models;

#[derive(Debug, QueryableByName)]
struct EligibleJob {
    #[diesel(sql_type = diesel::sql_types::Text)]
    id: String,
    #[diesel(sql_type = diesel::sql_types::Text)]
    status: String,
}

/// The eligibility query. Ordered by (priority DESC, created_at ASC) so the
/// loader serves the highest-priority, oldest work first. The retrying
/// clause mirrors [`super::retry_backoff`].
fn eligible_jobs_sql() -> String {
    format!(
        "SELECT id, status FROM jobs \
         WHERE status = 'pending' \
            OR (status = 'retrying' \
                AND (completed_at IS NULL \
                     OR completed_at < NOW() - make_interval(secs => \
                            LEAST({cap}, {base} * power(2, retry_count))))) \
            OR (status = 'running' AND started_at < NOW() - INTERVAL '{stale} seconds') \
         ORDER BY priority DESC, created_at ASC \
         LIMIT $1",
        cap = RETRY_BACKOFF_CAP_SECS,
        base = RETRY_BACKOFF_BASE_SECS,
        stale = STALE_RUNNING_AFTER.as_secs(),
    )
}

pub(super) async fn run_loader(inner: Arc<QueueInner>) {
    tracing::info!(period = ?LOADER_INTERVAL, "database job loader started");
    let mut interval = tokio::time::interval(LOADER_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(error) = load_batch(&inner).await {
            inner.metrics.loader_errors.inc();
            tracing::warn!(?error, "loader tick failed; retrying next tick");
        }
    }
    tracing::info!("database job loader stopped");
}

async fn load_batch(inner: &Arc<QueueInner>) -> anyhow::Result<()> {
    let mut conn = inner
        .pool
        .get()
        .await
        .context("loader could not check out a connection")?;

    let eligible: Vec<EligibleJob> = sql_query(eligible_jobs_sql())
        .bind::<BigInt, _>(LOADER_BATCH_SIZE)
        .get_results(&mut conn)
        .await
        .context("failed to query eligible jobs")?;

    let mut loaded = 0usize;
    for row in eligible {
        if claim(&mut conn, &row).await? != 1 {
            // Another process won the claim between our SELECT and UPDATE.
            inner.metrics.claim_conflicts.inc();
            continue;
        }

        let Some(job) = models::get_job(&mut conn, &row.id).await? else {
            continue;
        };

        match inner.tx.try_send(QueuedJob { job, claimed: true }) {
            Ok(()) => {
                inner.metrics.jobs_loaded.inc();
                loaded += 1;
            }
            Err(async_channel::TrySendError::Full(_)) => {
                rollback_claim(&mut conn, &row.id).await?;
                inner.metrics.channel_rollbacks.inc();
                inner
                    .log
                    .job_progress(
                        &row.id,
                        None,
                        &format!("Job queue full, job {} rolled back to pending", row.id),
                    )
                    .await;
                break;
            }
            Err(async_channel::TrySendError::Closed(_)) => {
                rollback_claim(&mut conn, &row.id).await?;
                break;
            }
        }
    }

    if loaded > 0 {
        inner
            .log
            .info(&format!("Loaded {loaded} jobs from database"))
            .await;
    }
    Ok(())
}

/// The claim transition. The WHERE clause re-checks the status the loader
/// observed (and, for stale `running` rows, re-checks the staleness window),
/// so exactly one of any number of concurrent claimants can see an affected
/// row count of one.
async fn claim(conn: &mut AsyncPgConnection, row: &EligibleJob) -> anyhow::Result<usize> {
    let affected = match row.status.as_str() {
        "running" => {
            sql_query(format!(
                "UPDATE jobs SET status = 'running', started_at = NOW() \
                 WHERE id = $1 AND status = 'running' \
                   AND started_at < NOW() - INTERVAL '{} seconds'",
                STALE_RUNNING_AFTER.as_secs(),
            ))
            .bind::<diesel::sql_types::Text, _>(&row.id)
            .execute(conn)
            .await
        }
        observed => {
            sql_query(
                "UPDATE jobs SET status = 'running', started_at = NOW() \
                 WHERE id = $1 AND status = $2",
            )
            .bind::<diesel::sql_types::Text, _>(&row.id)
            .bind::<diesel::sql_types::Text, _>(observed)
            .execute(conn)
            .await
        }
    };
    affected.with_context(|| format!("failed to claim job {}", row.id))
}

/// Returns a claimed-but-undeliverable job to the pool of pending work.
async fn rollback_claim(conn: &mut AsyncPgConnection, job_id: &str) -> anyhow::Result<()> {
    sql_query("UPDATE jobs SET status = 'pending', started_at = NULL WHERE id = $1")
        .bind::<diesel::sql_types::Text, _>(job_id)
        .execute(conn)
        .await
        .with_context(|| format!("failed to roll back claim of job {job_id}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_sql_encodes_the_tunables() {
        let sql = eligible_jobs_sql();
        assert!(sql.contains("INTERVAL '300 seconds'"));
        assert!(sql.contains("LEAST(300, 15 * power(2, retry_count))"));
        assert!(sql.contains("ORDER BY priority DESC, created_at ASC"));
        assert!(sql.contains("LIMIT $1"));
    }
}
