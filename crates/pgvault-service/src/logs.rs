// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Structured event log persisted in the control database.
//!
//! Every significant queue, worker, and scheduler step appends a row here,
//! tagged with the job and backup ids it concerns, so operators can follow
//! one backup across processes. Appends are best-effort: a failing log write
//! degrades to a `tracing` warning and never fails the calling operation.

use std::fmt;

use chrono::{DateTime, Utc};
use diesel::{ExpressionMethods, QueryDsl, QueryResult, Queryable, Selectable};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;

use crate::db::{schema::logs, DbPool};

/// Severity of a log entry. String forms match the `logs.level` CHECK
/// constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted log row, as served by the admin API.
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub component: String,
    pub job_id: Option<String>,
    pub backup_id: Option<String>,
    pub message: String,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Filter for log listings.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub job_id: Option<String>,
    pub backup_id: Option<String>,
    pub level: Option<String>,
    pub limit: Option<i64>,
}

/// Appender for one component's structured log rows.
#[derive(Clone)]
pub struct DbLogWriter {
    pool: DbPool,
    component: &'static str,
}

impl fmt::Debug for DbLogWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbLogWriter")
            .field("component", &self.component)
            .finish_non_exhaustive()
    }
}

impl DbLogWriter {
    pub fn new(pool: DbPool, component: &'static str) -> Self {
        Self { pool, component }
    }

    /// A writer for a different component sharing the same pool.
    pub fn for_component(&self, component: &'static str) -> Self {
        Self {
            pool: self.pool.clone(),
            component,
        }
    }

    /// Appends one entry. Failures are reported via `tracing` only.
    pub async fn append(
        &self,
        level: LogLevel,
        job_id: Option<&str>,
        backup_id: Option<&str>,
        message: &str,
        details: Option<&str>,
    ) {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(error) => {
                tracing::warn!(
                    ?error,
                    component = self.component,
                    message,
                    "no connection available for structured log entry"
                );
                return;
            }
        };

        let now = Utc::now();
        let result: QueryResult<usize> = diesel::insert_into(logs::table)
            .values((
                logs::timestamp.eq(now),
                logs::level.eq(level.as_str()),
                logs::component.eq(self.component),
                logs::job_id.eq(job_id),
                logs::backup_id.eq(backup_id),
                logs::message.eq(message),
                logs::details.eq(details),
                logs::created_at.eq(now),
            ))
            .execute(&mut conn)
            .await;

        if let Err(error) = result {
            tracing::warn!(
                ?error,
                component = self.component,
                message,
                "failed to append structured log entry"
            );
        }
    }

    pub async fn info(&self, message: &str) {
        tracing::info!(component = self.component, "{message}");
        self.append(LogLevel::Info, None, None, message, None).await;
    }

    pub async fn warn(&self, message: &str) {
        tracing::warn!(component = self.component, "{message}");
        self.append(LogLevel::Warn, None, None, message, None).await;
    }

    pub async fn error(&self, message: &str) {
        tracing::error!(component = self.component, "{message}");
        self.append(LogLevel::Error, None, None, message, None).await;
    }

    /// Progress line for one job, with optional backup correlation.
    pub async fn job_progress(&self, job_id: &str, backup_id: Option<&str>, message: &str) {
        tracing::info!(component = self.component, job_id, backup_id, "{message}");
        self.append(LogLevel::Info, Some(job_id), backup_id, message, None)
            .await;
    }

    /// Warning line for one job, with optional backup correlation.
    pub async fn job_warn(&self, job_id: &str, backup_id: Option<&str>, message: &str) {
        tracing::warn!(component = self.component, job_id, backup_id, "{message}");
        self.append(LogLevel::Warn, Some(job_id), backup_id, message, None)
            .await;
    }
}

/// Queries log rows, newest first.
pub async fn query_logs(
    conn: &mut AsyncPgConnection,
    filter: &LogFilter,
) -> QueryResult<Vec<LogEntry>> {
    let mut query = logs::table.into_boxed::<diesel::pg::Pg>();
    if let Some(job_id) = &filter.job_id {
        query = query.filter(logs::job_id.eq(job_id.clone()));
    }
    if let Some(backup_id) = &filter.backup_id {
        query = query.filter(logs::backup_id.eq(backup_id.clone()));
    }
    if let Some(level) = &filter.level {
        query = query.filter(logs::level.eq(level.clone()));
    }
    query
        .order(logs::timestamp.desc())
        .limit(filter.limit.unwrap_or(100))
        .load::<LogEntry>(conn)
        .await
}
