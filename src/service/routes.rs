//! HTTP routes for the leader and member services.
//!
//! - Leader: `POST /api/tasks`, `GET /api/tasks`
//! - Member: `PUT /api/tasks/status`
//! - Both: `GET /api/projection`, `GET /health`
//!
//! `/api/projection` lists every task this service has seen on its own copy
//! of the task queues. It trails the store by the time an event takes to
//! come back from the broker, and starts empty after a restart until the
//! queue copy delivers again.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use super::tasks::{NewTask, StatusUpdate, TaskError, TaskService};
use crate::projection::TaskProjection;
use crate::task::TaskRecord;

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub tasks: Arc<TaskService>,
    pub projection: Arc<TaskProjection>,
}

/// Router for the leader service.
pub fn leader_router(state: AppState) -> Router {
    common_routes()
        .route("/api/tasks", post(create_task).get(list_tasks))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the member service.
pub fn member_router(state: AppState) -> Router {
    common_routes()
        .route("/api/tasks/status", put(update_status))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn common_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/projection", get(projection))
}

#[derive(Debug, Serialize)]
struct TaskResponse {
    message: &'static str,
    task: TaskRecord,
}

impl IntoResponse for TaskError {
    fn into_response(self) -> Response {
        match self {
            TaskError::Invalid(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            TaskError::NotAssigned { .. } => (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "Task not found or not assigned to you" })),
            )
                .into_response(),
            TaskError::Store(e) => {
                error!(error = %e, "Store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Server error" })),
                )
                    .into_response()
            }
            TaskError::Publish { task, source } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": format!("Task saved but event not published: {}", source),
                    "retryable": source.is_retryable(),
                    "task": task,
                })),
            )
                .into_response(),
        }
    }
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<NewTask>,
) -> Result<(StatusCode, Json<TaskResponse>), TaskError> {
    let task = state.tasks.create_task(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(TaskResponse {
            message: "Task created",
            task,
        }),
    ))
}

async fn update_status(
    State(state): State<AppState>,
    Json(request): Json<StatusUpdate>,
) -> Result<Json<TaskResponse>, TaskError> {
    let task = state.tasks.update_status(request).await?;
    Ok(Json(TaskResponse {
        message: "Task status updated",
        task,
    }))
}

async fn list_tasks(State(state): State<AppState>) -> Result<Json<Vec<TaskRecord>>, TaskError> {
    Ok(Json(state.tasks.list_tasks().await?))
}

/// Tasks as seen through consumed events. Eventually consistent.
async fn projection(State(state): State<AppState>) -> Json<Vec<TaskRecord>> {
    Json(state.projection.snapshot().await)
}
