use std::str::FromStr;
use std::sync::Arc;

use anvil_common::SnapshotId;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::Deserialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::db::DbHandle;
use super::models::{AttemptDetail, FactoryDetail, FactoryStatus, NewFactory, SetupTaskStatus};
use super::registry::Registry;
use super::runner::BuildRunner;
use super::setup::SetupTracker;
use crate::errors::{FactoryError, WorkspaceError};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<String>,
    pub registry: Registry,
    pub setup: SetupTracker,
    pub runner: BuildRunner,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListFactoriesQuery {
    pub tenant_id: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

#[derive(Deserialize)]
pub struct SubmitFeatureRequest {
    pub description: String,
}

#[derive(Deserialize)]
pub struct GenerateSetupRequest {
    pub plan_summary: String,
}

#[derive(Deserialize)]
pub struct UpdateSetupTaskRequest {
    pub status: String,
}

#[derive(Deserialize)]
pub struct RevertRequest {
    pub snapshot_id: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<FactoryError> for ApiError {
    fn from(err: FactoryError) -> Self {
        let msg = err.to_string();
        match err {
            FactoryError::FactoryNotFound { .. }
            | FactoryError::AttemptNotFound { .. }
            | FactoryError::SetupTaskNotFound { .. }
            | FactoryError::Workspace(WorkspaceError::SnapshotNotFound { .. }) => {
                ApiError::NotFound(msg)
            }
            FactoryError::InvalidTransition { .. }
            | FactoryError::NotAcceptingRequests { .. }
            | FactoryError::BuildInFlight { .. }
            | FactoryError::AttemptNotRunning { .. }
            | FactoryError::Workspace(WorkspaceError::AlreadyExists { .. }) => {
                ApiError::Conflict(msg)
            }
            FactoryError::BadRequest(_)
            | FactoryError::Workspace(WorkspaceError::InvalidPath { .. })
            | FactoryError::Workspace(WorkspaceError::ForeignSnapshot { .. }) => {
                ApiError::BadRequest(msg)
            }
            FactoryError::Workspace(_) => ApiError::Internal(msg),
            FactoryError::Other(e) => ApiError::Internal(format!("{:#}", e)),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/factories", get(list_factories).post(create_factory))
        .route("/factories/{id}", get(get_factory))
        .route("/factories/{id}/status", patch(update_status))
        .route("/factories/{id}/features", post(submit_feature))
        .route("/factories/{id}/attempts", get(list_attempts))
        .route("/factories/{id}/attempts/{attempt_id}", get(get_attempt))
        .route(
            "/factories/{id}/attempts/{attempt_id}/cancel",
            post(cancel_attempt),
        )
        .route("/factories/{id}/setup", get(list_setup_tasks))
        .route("/factories/{id}/setup/generate", post(generate_setup_tasks))
        .route("/factories/{id}/setup/{task_id}", patch(update_setup_task))
        .route("/factories/{id}/escalations", get(list_escalations))
        .route("/factories/{id}/revert", post(revert_workspace))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_factory(
    State(state): State<SharedState>,
    Json(req): Json<NewFactory>,
) -> Result<impl IntoResponse, ApiError> {
    let factory = state.registry.create_factory(req).await?;
    Ok((StatusCode::CREATED, Json(factory)))
}

async fn list_factories(
    State(state): State<SharedState>,
    Query(query): Query<ListFactoriesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let factories = state.registry.list_by_tenant(query.tenant_id).await?;
    Ok(Json(factories))
}

async fn get_factory(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let factory = state.registry.get_factory(id).await?;
    let setup_tasks = state.setup.list_tasks(id).await?;
    let in_flight_attempt = state.runner.in_flight(id).await;
    Ok(Json(FactoryDetail {
        factory,
        setup_tasks,
        in_flight_attempt,
    }))
}

async fn update_status(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = FactoryStatus::from_str(&req.status).map_err(ApiError::BadRequest)?;
    let factory = state.registry.update_status(id, status).await?;
    Ok(Json(factory))
}

async fn submit_feature(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<SubmitFeatureRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let submitted = state.runner.submit(id, &req.description).await?;
    Ok((StatusCode::ACCEPTED, Json(submitted)))
}

async fn list_attempts(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.get_factory(id).await?;
    let attempts = state.db.call(move |db| db.list_attempts(id)).await?;
    Ok(Json(attempts))
}

async fn get_attempt(
    State(state): State<SharedState>,
    Path((id, attempt_id)): Path<(i64, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| {
            let Some(attempt) = db.get_attempt(attempt_id)? else {
                return Ok(None);
            };
            if attempt.factory_id != id {
                return Ok(None);
            }
            let Some(feature_request) = db.get_feature_request(attempt.feature_request_id)? else {
                return Ok(None);
            };
            Ok(Some(AttemptDetail {
                feature_request,
                state: attempt.current_state(),
                attempt,
            }))
        })
        .await?;
    match detail {
        Some(detail) => Ok(Json(detail)),
        None => Err(ApiError::NotFound(format!(
            "Build attempt {} not found",
            attempt_id
        ))),
    }
}

async fn cancel_attempt(
    State(state): State<SharedState>,
    Path((id, attempt_id)): Path<(i64, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    state.runner.cancel(id, attempt_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"attempt_id": attempt_id, "cancelling": true})),
    ))
}

async fn list_setup_tasks(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.setup.list_tasks(id).await?))
}

async fn generate_setup_tasks(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<GenerateSetupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state.setup.generate_tasks(id, &req.plan_summary).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_setup_task(
    State(state): State<SharedState>,
    Path((id, task_id)): Path<(i64, i64)>,
    Json(req): Json<UpdateSetupTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = SetupTaskStatus::from_str(&req.status).map_err(ApiError::BadRequest)?;
    let task = state.setup.get_task(task_id).await?;
    if task.factory_id != id {
        return Err(FactoryError::SetupTaskNotFound { id: task_id }.into());
    }
    Ok(Json(state.setup.update_task(task_id, status).await?))
}

async fn list_escalations(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.get_factory(id).await?;
    let records = state.db.call(move |db| db.list_escalations(id)).await?;
    Ok(Json(records))
}

async fn revert_workspace(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<RevertRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot_id = SnapshotId::from_str(&req.snapshot_id).map_err(ApiError::BadRequest)?;
    Ok(Json(state.runner.revert(id, snapshot_id).await?))
}
