// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Admin API error type and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};

use super::ApiResponse;
use crate::{db::PoolError, queue::EnqueueError};

/// Error returned by admin API handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request references an entity that does not exist. 404.
    #[error("{0} not found")]
    NotFound(String),
    /// The request is malformed or violates a precondition. 400.
    #[error("{0}")]
    Validation(String),
    /// The local job buffer is saturated. 503; the job row was persisted
    /// and will be picked up by a loader.
    #[error("job queue is full; the job was persisted and will run when capacity frees up")]
    QueueFull,
    /// The service is shutting down. 503.
    #[error("service is shutting down")]
    ShuttingDown,
    /// Internal fault. 500; details go to the log, not the client.
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl From<EnqueueError> for ApiError {
    fn from(error: EnqueueError) -> Self {
        match error {
            EnqueueError::QueueFull => Self::QueueFull,
            EnqueueError::ShuttingDown => Self::ShuttingDown,
            EnqueueError::Database(message) => Self::Internal(anyhow::anyhow!(message)),
        }
    }
}

impl From<diesel::result::Error> for ApiError {
    fn from(error: diesel::result::Error) -> Self {
        Self::Internal(error.into())
    }
}

impl From<PoolError> for ApiError {
    fn from(error: PoolError) -> Self {
        Self::Internal(anyhow::anyhow!(error.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::QueueFull | ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(error) => {
                tracing::error!(?error, "internal error serving admin request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ApiResponse::error(self.to_string()))).into_response()
    }
}
