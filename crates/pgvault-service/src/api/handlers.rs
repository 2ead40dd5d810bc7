// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Admin API route handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use pgvault_core::{priority, BackupStatus, Cadence, SslMode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiError, ApiResponse, ApiState};
use crate::{
    db::models::{self, Backup, BackupFilter, Instance, Job},
    logs::{self, LogFilter},
    queue::QueueStats,
    worker::WorkerStatus,
};

type Result<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

/// Instance representation served to clients. Never carries the password.
#[derive(Debug, Serialize)]
pub(super) struct InstanceResponse {
    id: String,
    name: String,
    host: String,
    port: i32,
    username: String,
    databases: Vec<String>,
    enabled: bool,
    ssl_mode: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<Instance> for InstanceResponse {
    fn from(instance: Instance) -> Self {
        let databases = instance.databases();
        Self {
            id: instance.id,
            name: instance.name,
            host: instance.host,
            port: instance.port,
            username: instance.username,
            databases,
            enabled: instance.enabled,
            ssl_mode: instance.ssl_mode,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateInstanceRequest {
    id: Option<String>,
    name: String,
    host: String,
    port: Option<i32>,
    username: String,
    password: String,
    databases: Option<Vec<String>>,
    enabled: Option<bool>,
    ssl_mode: Option<SslMode>,
}

#[derive(Debug, Deserialize)]
pub(super) struct UpdateInstanceRequest {
    name: Option<String>,
    host: Option<String>,
    port: Option<i32>,
    username: Option<String>,
    password: Option<String>,
    databases: Option<Vec<String>>,
    enabled: Option<bool>,
    ssl_mode: Option<SslMode>,
}

#[derive(Debug, Deserialize)]
pub(super) struct BackupRequest {
    instance_id: String,
    database_name: Option<String>,
    cadence: Option<Cadence>,
    priority: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub(super) struct RestoreRequest {
    backup_id: String,
    instance_id: String,
    database_name: String,
    priority: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub(super) struct BackupQuery {
    instance_id: Option<String>,
    status: Option<BackupStatus>,
    cadence: Option<Cadence>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(super) struct LogQuery {
    job_id: Option<String>,
    backup_id: Option<String>,
    level: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

pub(super) async fn list_instances(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<ApiResponse<Vec<InstanceResponse>>>> {
    let mut conn = state.pool.get().await?;
    let instances = models::list_instances(&mut conn).await?;
    Ok(Json(ApiResponse::ok(
        "Instances retrieved successfully",
        instances.into_iter().map(Into::into).collect(),
    )))
}

pub(super) async fn create_instance(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<ApiResponse<InstanceResponse>>)> {
    if let Some(databases) = &request.databases {
        if databases.is_empty() {
            return Err(ApiError::Validation(
                "databases must not be empty".to_owned(),
            ));
        }
    }

    let now = Utc::now();
    let instance = Instance {
        id: request
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("inst_{}", Uuid::new_v4().simple())),
        name: request.name,
        host: request.host,
        port: request.port.unwrap_or(5432),
        username: request.username,
        password: request.password,
        databases: serde_json::json!(request
            .databases
            .unwrap_or_else(|| vec!["postgres".to_owned()])),
        enabled: request.enabled.unwrap_or(true),
        ssl_mode: request.ssl_mode.unwrap_or_default().as_str().to_owned(),
        created_at: now,
        updated_at: now,
    };

    let mut conn = state.pool.get().await?;
    models::insert_instance(&mut conn, &instance)
        .await
        .map_err(unique_violation_to_validation)?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(
            "Instance created successfully",
            instance.into(),
        )),
    ))
}

pub(super) async fn get_instance(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<InstanceResponse>>> {
    let mut conn = state.pool.get().await?;
    let instance = models::get_instance(&mut conn, &id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("instance {id}")))?;
    Ok(Json(ApiResponse::ok(
        "Instance retrieved successfully",
        instance.into(),
    )))
}

pub(super) async fn update_instance(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateInstanceRequest>,
) -> Result<Json<ApiResponse<InstanceResponse>>> {
    if let Some(databases) = &request.databases {
        if databases.is_empty() {
            return Err(ApiError::Validation(
                "databases must not be empty".to_owned(),
            ));
        }
    }

    let mut conn = state.pool.get().await?;
    let mut instance = models::get_instance(&mut conn, &id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("instance {id}")))?;

    if let Some(name) = request.name {
        instance.name = name;
    }
    if let Some(host) = request.host {
        instance.host = host;
    }
    if let Some(port) = request.port {
        instance.port = port;
    }
    if let Some(username) = request.username {
        instance.username = username;
    }
    if let Some(password) = request.password {
        instance.password = password;
    }
    if let Some(databases) = request.databases {
        instance.databases = serde_json::json!(databases);
    }
    if let Some(enabled) = request.enabled {
        instance.enabled = enabled;
    }
    if let Some(ssl_mode) = request.ssl_mode {
        instance.ssl_mode = ssl_mode.as_str().to_owned();
    }

    models::update_instance(&mut conn, &instance)
        .await
        .map_err(unique_violation_to_validation)?;
    Ok(Json(ApiResponse::ok(
        "Instance updated successfully",
        instance.into(),
    )))
}

pub(super) async fn delete_instance(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>> {
    let mut conn = state.pool.get().await?;
    let deleted = models::delete_instance(&mut conn, &id).await?;
    if deleted == 0 {
        return Err(ApiError::NotFound(format!("instance {id}")));
    }
    Ok(Json(ApiResponse::ok("Instance deleted successfully", ())))
}

pub(super) async fn list_instance_backups(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Vec<Backup>>>> {
    let mut conn = state.pool.get().await?;
    if models::get_instance(&mut conn, &id).await?.is_none() {
        return Err(ApiError::NotFound(format!("instance {id}")));
    }
    let filter = BackupFilter {
        instance_id: Some(id),
        ..BackupFilter::default()
    };
    let backups = models::list_backups(&mut conn, &filter).await?;
    Ok(Json(ApiResponse::ok(
        "Backups retrieved successfully",
        backups,
    )))
}

// ---------------------------------------------------------------------------
// Backups & restores
// ---------------------------------------------------------------------------

pub(super) async fn list_backups(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<BackupQuery>,
) -> Result<Json<ApiResponse<Vec<Backup>>>> {
    let filter = BackupFilter {
        instance_id: query.instance_id,
        status: query.status,
        cadence: query.cadence,
        limit: query.limit,
    };
    let mut conn = state.pool.get().await?;
    let backups = models::list_backups(&mut conn, &filter).await?;
    Ok(Json(ApiResponse::ok(
        "Backups retrieved successfully",
        backups,
    )))
}

pub(super) async fn get_backup(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Backup>>> {
    let mut conn = state.pool.get().await?;
    let backup = models::get_backup(&mut conn, &id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("backup {id}")))?;
    Ok(Json(ApiResponse::ok("Backup retrieved successfully", backup)))
}

/// Accepts a manual backup request: creates the pending backup row, enqueues
/// the job, and returns the backup for the caller to poll.
pub(super) async fn create_backup(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<BackupRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Backup>>)> {
    let cadence = request.cadence.unwrap_or(Cadence::Manual);

    let (instance, database) = {
        let mut conn = state.pool.get().await?;
        let instance = models::get_instance(&mut conn, &request.instance_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("instance {}", request.instance_id)))?;
        if !instance.enabled {
            return Err(ApiError::Validation(format!(
                "instance {} is disabled",
                instance.id
            )));
        }
        let database = request
            .database_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| instance.databases()[0].clone());
        (instance, database)
    };

    let mut backup = Backup::new_pending(&instance.id, &database, cadence);
    {
        let mut conn = state.pool.get().await?;
        models::insert_backup(&mut conn, &backup).await?;
    }

    let job = state
        .queue
        .add_backup_job(
            &instance.id,
            &database,
            cadence,
            Some(&backup.id),
            request.priority.unwrap_or(priority::MANUAL_BACKUP),
        )
        .await?;

    backup.job_id = Some(job.id.clone());
    {
        let mut conn = state.pool.get().await?;
        if let Err(error) = models::set_backup_job_id(&mut conn, &backup.id, &job.id).await {
            tracing::warn!(backup_id = %backup.id, ?error, "failed to associate backup with job");
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::ok("Backup job created successfully", backup)),
    ))
}

/// Accepts a restore request for a completed backup.
pub(super) async fn create_restore(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<RestoreRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Job>>)> {
    if request.database_name.is_empty() {
        return Err(ApiError::Validation("database_name is required".to_owned()));
    }

    {
        let mut conn = state.pool.get().await?;
        let backup = models::get_backup(&mut conn, &request.backup_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("backup {}", request.backup_id)))?;
        if backup.status() != Some(BackupStatus::Completed) {
            return Err(ApiError::Validation(format!(
                "backup {} is not completed",
                backup.id
            )));
        }
        if models::get_instance(&mut conn, &request.instance_id)
            .await?
            .is_none()
        {
            return Err(ApiError::NotFound(format!(
                "instance {}",
                request.instance_id
            )));
        }
    }

    let job = state
        .queue
        .add_restore_job(
            &request.backup_id,
            &request.instance_id,
            &request.database_name,
            request.priority.unwrap_or(priority::RESTORE),
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::ok("Restore job created successfully", job)),
    ))
}

// ---------------------------------------------------------------------------
// Queue, workers, logs
// ---------------------------------------------------------------------------

/// Queue statistics computed from the control database, so they are
/// meaningful from any process.
pub(super) async fn queue_stats(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<ApiResponse<QueueStats>>> {
    let mut conn = state.pool.get().await?;
    let counts = models::count_jobs_by_status(&mut conn).await?;
    let count_of = |status: &str| {
        counts
            .iter()
            .find(|(s, _)| s.as_str() == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    };
    let stats = QueueStats {
        total_jobs: counts.iter().map(|(_, n)| n).sum(),
        pending_jobs: count_of("pending") + count_of("retrying"),
        running_jobs: count_of("running"),
        completed_jobs: count_of("completed"),
        failed_jobs: count_of("failed"),
        active_workers: state
            .queue
            .worker_statuses()
            .iter()
            .filter(|w| w.status == "working")
            .count(),
    };
    Ok(Json(ApiResponse::ok(
        "Queue statistics retrieved successfully",
        stats,
    )))
}

/// Status of the workers hosted by *this* process. The API process hosts
/// none; worker telemetry lives in the worker processes.
pub(super) async fn worker_status(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<ApiResponse<Vec<WorkerStatus>>>> {
    Ok(Json(ApiResponse::ok(
        "Worker status retrieved successfully",
        state.queue.worker_statuses(),
    )))
}

pub(super) async fn list_logs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LogQuery>,
) -> Result<Json<ApiResponse<Vec<logs::LogEntry>>>> {
    if let Some(level) = &query.level {
        if !matches!(level.as_str(), "DEBUG" | "INFO" | "WARN" | "ERROR") {
            return Err(ApiError::Validation(format!("invalid log level: {level}")));
        }
    }
    let filter = LogFilter {
        job_id: query.job_id,
        backup_id: query.backup_id,
        level: query.level,
        limit: query.limit,
    };
    let mut conn = state.pool.get().await?;
    let entries = logs::query_logs(&mut conn, &filter).await?;
    Ok(Json(ApiResponse::ok("Logs retrieved successfully", entries)))
}

// ---------------------------------------------------------------------------

fn unique_violation_to_validation(error: diesel::result::Error) -> ApiError {
    match &error {
        diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        ) => ApiError::Validation("an instance with this id or name already exists".to_owned()),
        _ => error.into(),
    }
}
