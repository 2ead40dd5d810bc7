// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! The admin HTTP surface.
//!
//! All responses use the uniform envelope `{success, message, data, error}`.
//! A 2xx on a backup or restore request means *accepted*: the dump has not
//! run yet, and the caller polls the backup/job status for the outcome.
//! Everything under `/api/v1` requires the shared-secret `api-key` header.

mod error;
mod handlers;

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

pub use error::ApiError;

use crate::{db::DbPool, queue::JobQueue};

/// Name of the authentication header carrying the shared secret.
const API_KEY_HEADER: &str = "api-key";

/// State shared by all route handlers.
pub struct ApiState {
    pub pool: DbPool,
    pub queue: JobQueue,
    pub api_key: String,
}

/// The uniform response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Builds the admin router.
pub fn router(state: Arc<ApiState>) -> Router {
    let authenticated = Router::new()
        .route(
            "/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/instances/{id}",
            get(handlers::get_instance)
                .put(handlers::update_instance)
                .delete(handlers::delete_instance),
        )
        .route("/instances/{id}/backups", get(handlers::list_instance_backups))
        .route(
            "/backups",
            get(handlers::list_backups).post(handlers::create_backup),
        )
        .route("/backups/{id}", get(handlers::get_backup))
        .route("/restores", post(handlers::create_restore))
        .route("/queue/stats", get(handlers::queue_stats))
        .route("/workers", get(handlers::worker_status))
        .route("/logs", get(handlers::list_logs))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", authenticated)
        .layer(cors_layer())
        .with_state(state)
}

async fn require_api_key(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    match provided {
        None => (
            StatusCode::UNAUTHORIZED,
            Json(ApiResponse::error("api-key header required")),
        )
            .into_response(),
        Some(key) if key != state.api_key => (
            StatusCode::UNAUTHORIZED,
            Json(ApiResponse::error("Invalid API key")),
        )
            .into_response(),
        Some(_) => next.run(request).await,
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(86400))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use prometheus::Registry;
    use tower::ServiceExt as _;

    use super::*;

    // Router-level tests that need no live control database: the middleware
    // rejects before any handler touches the pool.
    async fn test_router() -> Router {
        let pool = crate::db::establish_pool_lazy_for_tests();
        let registry = Registry::new();
        let queue = JobQueue::new(pool.clone(), &registry);
        router(Arc::new(ApiState {
            pool,
            queue,
            api_key: "secret".to_owned(),
        }))
    }

    #[tokio::test]
    async fn health_is_public() {
        let response = test_router()
            .await
            .oneshot(
                HttpRequest::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_api_key_is_unauthorized() {
        let response = test_router()
            .await
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/v1/instances")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_api_key_is_unauthorized() {
        let response = test_router()
            .await
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/v1/instances")
                    .header(API_KEY_HEADER, "not-the-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn validation_errors_reach_the_envelope() {
        // Empty `databases` is rejected before any control-database access,
        // so this also exercises the accepted-key path.
        let body = serde_json::json!({
            "name": "pg1",
            "host": "localhost",
            "username": "postgres",
            "password": "secret",
            "databases": [],
        });
        let response = test_router()
            .await
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/v1/instances")
                    .header(API_KEY_HEADER, "secret")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["error"], "databases must not be empty");
    }

    #[test]
    fn envelope_serialization_skips_empty_fields() {
        let ok = serde_json::to_value(ApiResponse::ok("created", 7)).unwrap();
        assert_eq!(
            ok,
            serde_json::json!({"success": true, "message": "created", "data": 7})
        );

        let error = serde_json::to_value(ApiResponse::error("boom")).unwrap();
        assert_eq!(error, serde_json::json!({"success": false, "error": "boom"}));
    }
}
