// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! The wall-clock scheduler: fans cadence ticks out into per-instance,
//! per-database backup jobs.
//!
//! The scheduler never executes backups; it only inserts rows and enqueues
//! jobs. Each tick is guarded by a `(cadence, bucket_start)` lease row
//! inserted with `ON CONFLICT DO NOTHING`, so running a scheduler in every
//! worker process is safe: exactly one wins the insert and fans out, the
//! rest observe a conflict and skip.
//!
//! Trigger times (UTC):
//!   - hourly  — every hour at minute 0
//!   - daily   — every day at 02:00:00
//!   - weekly  — every Sunday at 03:00:00
//!   - monthly — on day 1 at 04:00:00

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Timelike, Utc};
use pgvault_core::{priority, Cadence};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    common::metrics::SchedulerMetricSet,
    db::{
        models::{self, Backup},
        DbPool,
    },
    logs::DbLogWriter,
    queue::{EnqueueError, JobQueue},
};

/// The next wall-clock fire time for `cadence` strictly after `after`.
/// Returns `None` for the manual cadence, which has no trigger.
pub fn next_fire(cadence: Cadence, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let candidate = match cadence {
        Cadence::Hourly => {
            let hour_start = after
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .expect("minute/second zero is always valid");
            hour_start + ChronoDuration::hours(1)
        }
        Cadence::Daily => {
            let today = at_time(after.date_naive(), 2);
            if today > after {
                today
            } else {
                at_time(after.date_naive() + ChronoDuration::days(1), 2)
            }
        }
        Cadence::Weekly => {
            let today = at_time(after.date_naive(), 3);
            if after.weekday() == chrono::Weekday::Sun && today > after {
                today
            } else {
                // Days until the next Sunday; a full week when `after` is
                // already past this Sunday's trigger.
                let days = 7 - after.weekday().num_days_from_sunday();
                at_time(
                    after.date_naive() + ChronoDuration::days(i64::from(days)),
                    3,
                )
            }
        }
        Cadence::Monthly => {
            let first_of_month = NaiveDate::from_ymd_opt(after.year(), after.month(), 1)
                .expect("the first of a valid month exists");
            let this_month = at_time(first_of_month, 4);
            if this_month > after {
                this_month
            } else {
                at_time(first_of_next_month(after.year(), after.month()), 4)
            }
        }
        Cadence::Manual => return None,
    };
    Some(candidate)
}

fn at_time(date: NaiveDate, hour: u32) -> DateTime<Utc> {
    Utc.from_utc_datetime(
        &date
            .and_hms_opt(hour, 0, 0)
            .expect("whole hours are always valid"),
    )
}

fn first_of_next_month(year: i32, month: u32) -> NaiveDate {
    let (year, month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).expect("the first of a valid month exists")
}

/// The earliest upcoming trigger time and every cadence that fires at it.
///
/// Coincidence is the norm, not the exception: the daily, weekly, and
/// monthly triggers all fall on an hourly boundary, so one wakeup regularly
/// has to fire several cadences.
fn next_events(after: DateTime<Utc>) -> (DateTime<Utc>, Vec<Cadence>) {
    let fires: Vec<(Cadence, DateTime<Utc>)> = Cadence::SCHEDULED
        .iter()
        .filter_map(|&cadence| next_fire(cadence, after).map(|at| (cadence, at)))
        .collect();
    let earliest = fires
        .iter()
        .map(|(_, at)| *at)
        .min()
        .expect("there is always a next scheduled trigger");
    let cadences = fires
        .into_iter()
        .filter(|(_, at)| *at == earliest)
        .map(|(cadence, _)| cadence)
        .collect();
    (earliest, cadences)
}

/// The wall-clock cron driving automatic backups.
pub struct Scheduler {
    pool: DbPool,
    queue: JobQueue,
    log: DbLogWriter,
    metrics: SchedulerMetricSet,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        pool: DbPool,
        queue: JobQueue,
        metrics: SchedulerMetricSet,
        cancel: CancellationToken,
    ) -> Self {
        let log = DbLogWriter::new(pool.clone(), "SCHEDULER");
        Self {
            pool,
            queue,
            log,
            metrics,
            cancel,
        }
    }

    /// Spawns the scheduler loop. It runs until the cancellation token
    /// fires.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        tracing::info!("backup scheduler started");
        loop {
            let (fire_at, cadences) = next_events(Utc::now());
            let wait = (fire_at - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tracing::debug!(?cadences, %fire_at, "scheduler sleeping until next trigger");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            for cadence in cadences {
                self.metrics.ticks.with_label_values(&[cadence.as_str()]).inc();
                if let Err(error) = self.tick(cadence, fire_at).await {
                    tracing::error!(%cadence, ?error, "scheduler tick failed");
                    self.log
                        .error(&format!("Failed to run {cadence} trigger: {error}"))
                        .await;
                }
            }
        }
        tracing::info!("backup scheduler stopped");
    }

    /// Handles one cadence trigger: claim the tick lease, then create one
    /// pending backup and one backup job per (enabled instance, database).
    async fn tick(&self, cadence: Cadence, bucket_start: DateTime<Utc>) -> anyhow::Result<()> {
        let instances = {
            let mut conn = self.pool.get().await?;
            if !models::try_claim_schedule_slot(&mut conn, cadence, bucket_start).await? {
                self.metrics.lease_conflicts.inc();
                tracing::debug!(%cadence, %bucket_start, "another scheduler holds this tick");
                return Ok(());
            }
            models::list_enabled_instances(&mut conn).await?
        };

        let mut created = 0usize;
        for instance in &instances {
            for database in instance.databases() {
                match self.create_backup_job(instance.id.as_str(), &database, cadence).await {
                    Ok(()) => created += 1,
                    Err(error) => {
                        self.log
                            .error(&format!(
                                "Failed to create {cadence} backup job for {}/{database}: {error}",
                                instance.name
                            ))
                            .await;
                    }
                }
            }
        }

        self.metrics
            .jobs_created
            .with_label_values(&[cadence.as_str()])
            .inc_by(created as u64);
        self.log
            .info(&format!("Created {created} {cadence} backup jobs"))
            .await;
        Ok(())
    }

    async fn create_backup_job(
        &self,
        instance_id: &str,
        database: &str,
        cadence: Cadence,
    ) -> anyhow::Result<()> {
        // The backup row precedes the job so retries reuse it instead of
        // creating duplicates.
        let backup = Backup::new_pending(instance_id, database, cadence);
        {
            let mut conn = self.pool.get().await?;
            models::insert_backup(&mut conn, &backup).await?;
        }

        let job = match self
            .queue
            .add_backup_job(
                instance_id,
                database,
                cadence,
                Some(&backup.id),
                priority::SCHEDULED_BACKUP,
            )
            .await
        {
            Ok(job) => Some(job),
            Err(EnqueueError::QueueFull) => {
                // Persisted; a loader will pick it up. The job id is unknown
                // here, so the backfill below is skipped.
                tracing::warn!(instance_id, database, "local queue full; job persisted for loader pickup");
                None
            }
            Err(error) => return Err(error.into()),
        };

        if let Some(job) = job {
            let backfill: anyhow::Result<()> = async {
                let mut conn = self.pool.get().await?;
                models::set_backup_job_id(&mut conn, &backup.id, &job.id).await?;
                Ok(())
            }
            .await;
            if let Err(error) = backfill {
                // Best-effort: only log correlation is lost.
                tracing::warn!(backup_id = %backup.id, job_id = %job.id, ?error,
                    "failed to associate backup with job");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pgvault_test_utils::param_test;

    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    param_test! {
        hourly_fires_at_minute_zero: [
            mid_hour: (utc(2025, 7, 18, 8, 41, 3), utc(2025, 7, 18, 9, 0, 0)),
            on_the_hour: (utc(2025, 7, 18, 8, 0, 0), utc(2025, 7, 18, 9, 0, 0)),
            end_of_day: (utc(2025, 7, 18, 23, 30, 0), utc(2025, 7, 19, 0, 0, 0)),
            end_of_year: (utc(2024, 12, 31, 23, 59, 59), utc(2025, 1, 1, 0, 0, 0)),
        ]
    }
    fn hourly_fires_at_minute_zero(after: DateTime<Utc>, expected: DateTime<Utc>) {
        assert_eq!(next_fire(Cadence::Hourly, after), Some(expected));
    }

    param_test! {
        daily_fires_at_two: [
            before_two: (utc(2025, 7, 18, 1, 0, 0), utc(2025, 7, 18, 2, 0, 0)),
            exactly_two: (utc(2025, 7, 18, 2, 0, 0), utc(2025, 7, 19, 2, 0, 0)),
            after_two: (utc(2025, 7, 18, 14, 0, 0), utc(2025, 7, 19, 2, 0, 0)),
        ]
    }
    fn daily_fires_at_two(after: DateTime<Utc>, expected: DateTime<Utc>) {
        assert_eq!(next_fire(Cadence::Daily, after), Some(expected));
    }

    param_test! {
        weekly_fires_sunday_at_three: [
            // 2025-07-20 is a Sunday.
            midweek: (utc(2025, 7, 16, 12, 0, 0), utc(2025, 7, 20, 3, 0, 0)),
            sunday_before_three: (utc(2025, 7, 20, 1, 0, 0), utc(2025, 7, 20, 3, 0, 0)),
            sunday_after_three: (utc(2025, 7, 20, 3, 0, 0), utc(2025, 7, 27, 3, 0, 0)),
            saturday: (utc(2025, 7, 19, 23, 0, 0), utc(2025, 7, 20, 3, 0, 0)),
        ]
    }
    fn weekly_fires_sunday_at_three(after: DateTime<Utc>, expected: DateTime<Utc>) {
        assert_eq!(next_fire(Cadence::Weekly, after), Some(expected));
    }

    param_test! {
        monthly_fires_first_at_four: [
            mid_month: (utc(2025, 7, 18, 0, 0, 0), utc(2025, 8, 1, 4, 0, 0)),
            first_before_four: (utc(2025, 7, 1, 3, 59, 59), utc(2025, 7, 1, 4, 0, 0)),
            first_after_four: (utc(2025, 7, 1, 4, 0, 0), utc(2025, 8, 1, 4, 0, 0)),
            december_rolls_year: (utc(2025, 12, 15, 0, 0, 0), utc(2026, 1, 1, 4, 0, 0)),
        ]
    }
    fn monthly_fires_first_at_four(after: DateTime<Utc>, expected: DateTime<Utc>) {
        assert_eq!(next_fire(Cadence::Monthly, after), Some(expected));
    }

    #[test]
    fn manual_has_no_trigger() {
        assert_eq!(next_fire(Cadence::Manual, utc(2025, 7, 18, 0, 0, 0)), None);
    }

    #[test]
    fn ordinary_hours_fire_hourly_alone() {
        let (at, cadences) = next_events(utc(2025, 7, 18, 14, 10, 0));
        assert_eq!(at, utc(2025, 7, 18, 15, 0, 0));
        assert_eq!(cadences, vec![Cadence::Hourly]);
    }

    #[test]
    fn coinciding_triggers_all_fire() {
        // Every daily, weekly, and monthly trigger falls on an hourly
        // boundary; a wakeup must fire all of them, not just one.
        let (at, cadences) = next_events(utc(2025, 7, 18, 1, 30, 0));
        assert_eq!(at, utc(2025, 7, 18, 2, 0, 0));
        assert_eq!(cadences, vec![Cadence::Hourly, Cadence::Daily]);

        // 2025-07-20 is a Sunday: 03:00 is hourly + weekly.
        let (at, cadences) = next_events(utc(2025, 7, 20, 2, 30, 0));
        assert_eq!(at, utc(2025, 7, 20, 3, 0, 0));
        assert_eq!(cadences, vec![Cadence::Hourly, Cadence::Weekly]);

        // The first of the month at 04:00 is hourly + monthly.
        let (at, cadences) = next_events(utc(2025, 8, 1, 3, 30, 0));
        assert_eq!(at, utc(2025, 8, 1, 4, 0, 0));
        assert_eq!(cadences, vec![Cadence::Hourly, Cadence::Monthly]);
    }
}
