// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Row types and data access for the control database.
//!
//! Enumerated columns are stored as their canonical strings (guarded by
//! CHECK constraints) and parsed back into the `pgvault-core` vocabulary at
//! the point of use, so a corrupted row degrades into a handler error
//! instead of a panic.

use chrono::{DateTime, Utc};
use diesel::{
    ExpressionMethods, Insertable, OptionalExtension, QueryDsl, QueryResult, Queryable, Selectable,
};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use pgvault_core::{BackupStatus, Cadence, JobStatus, JobType, SslMode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::schema::{backups, instances, jobs, schedule_marks};

/// A registered PostgreSQL instance.
///
/// Owned by the admin surface; the worker only ever reads it.
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = instances)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub username: String,
    pub password: String,
    pub databases: serde_json::Value,
    pub enabled: bool,
    pub ssl_mode: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    /// The logical databases to back up on this instance.
    ///
    /// Falls back to `["postgres"]` when the stored array is empty or not an
    /// array of strings.
    pub fn databases(&self) -> Vec<String> {
        let parsed: Vec<String> = self
            .databases
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        if parsed.is_empty() {
            vec!["postgres".to_owned()]
        } else {
            parsed
        }
    }

    /// The SSL mode for connections to this instance.
    pub fn ssl_mode(&self) -> SslMode {
        self.ssl_mode.parse().unwrap_or_default()
    }
}

/// The durable record of one dump attempt of one database.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = backups)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Backup {
    pub id: String,
    pub instance_id: String,
    pub database_name: String,
    pub cadence: String,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub file_path: Option<String>,
    pub file_size: i64,
    pub object_key: Option<String>,
    pub error_message: Option<String>,
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Backup {
    /// Creates a new pending backup record for `(instance, database)`.
    pub fn new_pending(instance_id: &str, database_name: &str, cadence: Cadence) -> Self {
        let now = Utc::now();
        Self {
            id: format!("backup_{}", Uuid::new_v4().simple()),
            instance_id: instance_id.to_owned(),
            database_name: database_name.to_owned(),
            cadence: cadence.as_str().to_owned(),
            status: BackupStatus::Pending.as_str().to_owned(),
            start_time: now,
            end_time: None,
            file_path: None,
            file_size: 0,
            object_key: None,
            error_message: None,
            job_id: None,
            created_at: now,
        }
    }

    /// Sets the backup status, keeping the string column in sync with the
    /// typed vocabulary.
    pub fn set_status(&mut self, status: BackupStatus) {
        self.status = status.as_str().to_owned();
    }

    /// The parsed backup status.
    pub fn status(&self) -> Option<BackupStatus> {
        self.status.parse().ok()
    }

    /// The parsed cadence.
    pub fn cadence(&self) -> Option<Cadence> {
        self.cadence.parse().ok()
    }
}

/// The typed view of the `jobs.payload` JSONB column.
///
/// All fields are optional at the serialization layer; each handler checks
/// for the fields its job type requires.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cadence: Option<Cadence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

impl JobPayload {
    /// Payload for a backup job. `backup_id` refers to the pre-created
    /// backup row when the producer made one.
    pub fn backup(instance_id: &str, database_name: &str, cadence: Cadence, backup_id: Option<&str>) -> Self {
        Self {
            instance_id: Some(instance_id.to_owned()),
            database_name: Some(database_name.to_owned()),
            cadence: Some(cadence),
            backup_id: backup_id.map(str::to_owned),
        }
    }

    /// Payload for a restore job targeting `(instance, database)`.
    pub fn restore(backup_id: &str, instance_id: &str, database_name: &str) -> Self {
        Self {
            instance_id: Some(instance_id.to_owned()),
            database_name: Some(database_name.to_owned()),
            cadence: None,
            backup_id: Some(backup_id.to_owned()),
        }
    }

    /// Payload for a retention cleanup job over one `(instance, cadence)`
    /// prefix.
    pub fn cleanup(instance_id: &str, cadence: Cadence) -> Self {
        Self {
            instance_id: Some(instance_id.to_owned()),
            database_name: None,
            cadence: Some(cadence),
            backup_id: None,
        }
    }
}

/// A unit of work for the queue.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = jobs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: String,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Creates a new pending job with an assigned id, creation time, and the
    /// default retry budget for its type.
    pub fn new(job_type: JobType, payload: &JobPayload, priority: i32) -> Self {
        Self {
            id: format!("job_{}", Uuid::new_v4().simple()),
            job_type: job_type.as_str().to_owned(),
            status: JobStatus::Pending.as_str().to_owned(),
            priority,
            payload: serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({})),
            retry_count: 0,
            max_retries: job_type.default_max_retries(),
            error_message: None,
            worker_id: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    /// The parsed job type.
    pub fn job_type(&self) -> Option<JobType> {
        self.job_type.parse().ok()
    }

    /// The typed view of the payload column.
    pub fn payload(&self) -> Result<JobPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

pub async fn insert_instance(conn: &mut AsyncPgConnection, instance: &Instance) -> QueryResult<usize> {
    diesel::insert_into(instances::table)
        .values(instance)
        .execute(conn)
        .await
}

pub async fn update_instance(conn: &mut AsyncPgConnection, instance: &Instance) -> QueryResult<usize> {
    diesel::update(instances::table.filter(instances::id.eq(instance.id.as_str())))
        .set((
            instances::name.eq(instance.name.as_str()),
            instances::host.eq(instance.host.as_str()),
            instances::port.eq(instance.port),
            instances::username.eq(instance.username.as_str()),
            instances::password.eq(instance.password.as_str()),
            instances::databases.eq(instance.databases.clone()),
            instances::enabled.eq(instance.enabled),
            instances::ssl_mode.eq(instance.ssl_mode.as_str()),
            instances::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await
}

pub async fn get_instance(conn: &mut AsyncPgConnection, id: &str) -> QueryResult<Option<Instance>> {
    instances::table
        .filter(instances::id.eq(id))
        .first::<Instance>(conn)
        .await
        .optional()
}

pub async fn list_instances(conn: &mut AsyncPgConnection) -> QueryResult<Vec<Instance>> {
    instances::table
        .order(instances::name.asc())
        .load::<Instance>(conn)
        .await
}

/// Instances the scheduler fans out over. Disabled instances never produce
/// jobs.
pub async fn list_enabled_instances(conn: &mut AsyncPgConnection) -> QueryResult<Vec<Instance>> {
    instances::table
        .filter(instances::enabled.eq(true))
        .order(instances::name.asc())
        .load::<Instance>(conn)
        .await
}

/// Deletes an instance; backups cascade at the database layer.
pub async fn delete_instance(conn: &mut AsyncPgConnection, id: &str) -> QueryResult<usize> {
    diesel::delete(instances::table.filter(instances::id.eq(id)))
        .execute(conn)
        .await
}

// ---------------------------------------------------------------------------
// Backups
// ---------------------------------------------------------------------------

/// Filter for backup listings. `limit` is always applied.
#[derive(Debug, Clone, Default)]
pub struct BackupFilter {
    pub instance_id: Option<String>,
    pub status: Option<BackupStatus>,
    pub cadence: Option<Cadence>,
    pub limit: Option<i64>,
}

pub async fn insert_backup(conn: &mut AsyncPgConnection, backup: &Backup) -> QueryResult<usize> {
    diesel::insert_into(backups::table)
        .values(backup)
        .execute(conn)
        .await
}

/// Persists the mutable portion of a backup record.
pub async fn update_backup(conn: &mut AsyncPgConnection, backup: &Backup) -> QueryResult<usize> {
    diesel::update(backups::table.filter(backups::id.eq(backup.id.as_str())))
        .set((
            backups::status.eq(backup.status.as_str()),
            backups::start_time.eq(backup.start_time),
            backups::end_time.eq(backup.end_time),
            backups::file_path.eq(backup.file_path.as_deref()),
            backups::file_size.eq(backup.file_size),
            backups::object_key.eq(backup.object_key.as_deref()),
            backups::error_message.eq(backup.error_message.as_deref()),
            backups::job_id.eq(backup.job_id.as_deref()),
        ))
        .execute(conn)
        .await
}

pub async fn get_backup(conn: &mut AsyncPgConnection, id: &str) -> QueryResult<Option<Backup>> {
    backups::table
        .filter(backups::id.eq(id))
        .first::<Backup>(conn)
        .await
        .optional()
}

pub async fn list_backups(
    conn: &mut AsyncPgConnection,
    filter: &BackupFilter,
) -> QueryResult<Vec<Backup>> {
    let mut query = backups::table.into_boxed::<diesel::pg::Pg>();
    if let Some(instance_id) = &filter.instance_id {
        query = query.filter(backups::instance_id.eq(instance_id.clone()));
    }
    if let Some(status) = filter.status {
        query = query.filter(backups::status.eq(status.as_str()));
    }
    if let Some(cadence) = filter.cadence {
        query = query.filter(backups::cadence.eq(cadence.as_str()));
    }
    query
        .order(backups::created_at.desc())
        .limit(filter.limit.unwrap_or(100))
        .load::<Backup>(conn)
        .await
}

/// Associates a backup row with the job that will execute it. Best-effort on
/// the caller's side: a failure here only loses log correlation.
pub async fn set_backup_job_id(
    conn: &mut AsyncPgConnection,
    backup_id: &str,
    job_id: &str,
) -> QueryResult<usize> {
    diesel::update(backups::table.filter(backups::id.eq(backup_id)))
        .set(backups::job_id.eq(job_id))
        .execute(conn)
        .await
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

pub async fn insert_job(conn: &mut AsyncPgConnection, job: &Job) -> QueryResult<usize> {
    diesel::insert_into(jobs::table).values(job).execute(conn).await
}

pub async fn get_job(conn: &mut AsyncPgConnection, id: &str) -> QueryResult<Option<Job>> {
    jobs::table
        .filter(jobs::id.eq(id))
        .first::<Job>(conn)
        .await
        .optional()
}

/// Records which worker is executing a job. Diagnostics only; the claim
/// itself is the status transition performed by the queue.
pub async fn set_job_worker(
    conn: &mut AsyncPgConnection,
    job_id: &str,
    worker_id: &str,
) -> QueryResult<usize> {
    diesel::update(jobs::table.filter(jobs::id.eq(job_id)))
        .set(jobs::worker_id.eq(worker_id))
        .execute(conn)
        .await
}

/// Writes the terminal (or retrying) state of a job after an attempt.
pub async fn finish_job(
    conn: &mut AsyncPgConnection,
    job_id: &str,
    status: JobStatus,
    retry_count: i32,
    error_message: Option<&str>,
) -> QueryResult<usize> {
    diesel::update(jobs::table.filter(jobs::id.eq(job_id)))
        .set((
            jobs::status.eq(status.as_str()),
            jobs::retry_count.eq(retry_count),
            jobs::completed_at.eq(Utc::now()),
            jobs::error_message.eq(error_message),
        ))
        .execute(conn)
        .await
}

/// Per-status job counts, used for queue statistics.
pub async fn count_jobs_by_status(
    conn: &mut AsyncPgConnection,
) -> QueryResult<Vec<(String, i64)>> {
    use diesel::dsl::count_star;
    jobs::table
        .group_by(jobs::status)
        .select((jobs::status, count_star()))
        .load::<(String, i64)>(conn)
        .await
}

// ---------------------------------------------------------------------------
// Schedule marks
// ---------------------------------------------------------------------------

/// Claims the scheduler lease for one `(cadence, bucket)` tick.
///
/// Returns true iff this caller won the insert and should fan out jobs.
pub async fn try_claim_schedule_slot(
    conn: &mut AsyncPgConnection,
    cadence: Cadence,
    bucket_start: DateTime<Utc>,
) -> QueryResult<bool> {
    let inserted = diesel::insert_into(schedule_marks::table)
        .values((
            schedule_marks::cadence.eq(cadence.as_str()),
            schedule_marks::bucket_start.eq(bucket_start),
            schedule_marks::created_at.eq(Utc::now()),
        ))
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    Ok(inserted == 1)
}

#[cfg(test)]
mod tests {
    use pgvault_test_utils::param_test;

    use super::*;

    #[test]
    fn job_defaults() {
        let payload = JobPayload::backup("pg1", "app", Cadence::Manual, None);
        let job = Job::new(JobType::Backup, &payload, 5);
        assert!(job.id.starts_with("job_"));
        assert_eq!(job.status, "pending");
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.job_type(), Some(JobType::Backup));
        assert_eq!(job.payload().unwrap(), payload);

        let restore = Job::new(JobType::Restore, &JobPayload::restore("b", "pg1", "app"), 8);
        assert_eq!(restore.max_retries, 1);
    }

    #[test]
    fn payload_round_trips_through_json() {
        let payload = JobPayload::backup("pg1", "app", Cadence::Hourly, Some("backup_1"));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["cadence"], "hourly");
        let back: JobPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);

        // Fields absent from older payloads deserialize as None.
        let sparse: JobPayload =
            serde_json::from_value(serde_json::json!({"instance_id": "pg1"})).unwrap();
        assert_eq!(sparse.instance_id.as_deref(), Some("pg1"));
        assert_eq!(sparse.backup_id, None);
    }

    param_test! {
        instance_databases_fallback: [
            empty_array: (serde_json::json!([]), vec!["postgres"]),
            not_an_array: (serde_json::json!("app"), vec!["postgres"]),
            listed: (serde_json::json!(["d1", "d2"]), vec!["d1", "d2"]),
        ]
    }
    fn instance_databases_fallback(databases: serde_json::Value, expected: Vec<&str>) {
        let instance = Instance {
            id: "pg1".into(),
            name: "pg1".into(),
            host: "localhost".into(),
            port: 5432,
            username: "postgres".into(),
            password: "secret".into(),
            databases,
            enabled: true,
            ssl_mode: "prefer".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(instance.databases(), expected);
    }

    #[test]
    fn backup_new_pending_is_consistent() {
        let backup = Backup::new_pending("pg1", "app", Cadence::Daily);
        assert!(backup.id.starts_with("backup_"));
        assert_eq!(backup.status(), Some(BackupStatus::Pending));
        assert_eq!(backup.cadence(), Some(Cadence::Daily));
        assert_eq!(backup.end_time, None);
        assert_eq!(backup.file_size, 0);
    }
}
