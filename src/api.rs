use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::artifact::StageKind;
use crate::errors::{GateError, ReviewError, StageError};
use crate::pipeline::{Pipeline, StageRequest};
use crate::review::{DecisionInput, ReviewResponse, SubmitRequest};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

/// Body of a stage run. The project and stage come from the path.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RunStageRequest {
    pub scope: Option<String>,
    pub input: String,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub preferences: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunStageResponse {
    pub artifact_id: String,
    pub stage: StageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub review: ReviewResponse,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    PreconditionFailed(String),
    TooManyRequests(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::PreconditionFailed(msg) => (StatusCode::PRECONDITION_FAILED, msg),
            ApiError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<ReviewError> for ApiError {
    fn from(err: ReviewError) -> Self {
        let msg = err.to_string();
        match err {
            ReviewError::Validation { .. } => ApiError::BadRequest(msg),
            ReviewError::NotFound { .. } => ApiError::NotFound(msg),
            ReviewError::InvalidState { .. } => ApiError::Conflict(msg),
            ReviewError::CapacityExceeded { .. } => ApiError::TooManyRequests(msg),
            ReviewError::Sweep(_) | ReviewError::Undelivered { .. } => ApiError::Internal(msg),
        }
    }
}

impl From<StageError> for ApiError {
    fn from(err: StageError) -> Self {
        let msg = err.to_string();
        match err {
            StageError::Review(e) => e.into(),
            StageError::Gate(GateError::PrerequisitesNotMet { .. }) => {
                ApiError::PreconditionFailed(msg)
            }
            StageError::Gate(GateError::SlotBusy { .. }) => ApiError::Conflict(msg),
            StageError::Gate(GateError::InvalidScope { .. }) | StageError::MissingInput { .. } => {
                ApiError::BadRequest(msg)
            }
            StageError::ArtifactNotFound { .. } => ApiError::NotFound(msg),
            StageError::InvalidTransition { .. } => ApiError::Conflict(msg),
            StageError::Generation(_) => ApiError::Internal(msg),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/reviews", post(submit_review))
        .route("/api/reviews/pending", get(list_pending))
        .route("/api/reviews/{id}", get(get_review))
        .route("/api/reviews/{id}/approve", post(approve_review))
        .route("/api/reviews/{id}/reject", post(reject_review))
        .route("/api/reviews/{id}/dispatch", post(redispatch_review))
        .route("/api/projects/{id}/workflow", get(workflow_status))
        .route("/api/projects/{id}/stages/{stage}/run", post(run_stage))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> Response {
    let service = state.pipeline.service();
    let healthy = service.is_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "sweeper_running": state.pipeline.sweeper().is_running(),
        "reviews": service.stats(),
    });
    (status, Json(body)).into_response()
}

async fn submit_review(
    State(state): State<SharedState>,
    Json(req): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = state.pipeline.service().submit(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(ReviewResponse::submitted(&submission)),
    ))
}

async fn list_pending(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.pipeline.service().list_pending().await)
}

async fn get_review(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = state
        .pipeline
        .service()
        .get(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Review {} not found", id)))?;
    Ok(Json(submission))
}

/// The decision body is optional; an empty body records the default
/// approval.
async fn approve_review(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let decision = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        let input: DecisionInput = serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid decision body: {}", e)))?;
        Some(input)
    };
    let response = state.pipeline.service().approve(&id, decision).await?;
    Ok(Json(response))
}

async fn reject_review(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(decision): Json<DecisionInput>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.pipeline.service().reject(&id, decision).await?;
    Ok(Json(response))
}

async fn redispatch_review(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.pipeline.service().redispatch(&id).await?;
    Ok(Json(outcome))
}

async fn workflow_status(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> impl IntoResponse {
    Json(state.pipeline.workflow_status(&project_id))
}

async fn run_stage(
    State(state): State<SharedState>,
    Path((project_id, stage)): Path<(String, String)>,
    Json(body): Json<RunStageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stage = StageKind::resolve(&stage)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown stage: {}", stage)))?;

    let request = StageRequest {
        scope: body.scope,
        input: body.input,
        title: body.title,
        tags: body.tags,
        preferences: body.preferences,
        ..StageRequest::new(&project_id, stage)
    };
    let run = state.pipeline.run_stage(request).await?;

    Ok((
        StatusCode::CREATED,
        Json(RunStageResponse {
            artifact_id: run.artifact.id.clone(),
            stage: run.artifact.stage,
            scope: run.artifact.scope.clone(),
            review: ReviewResponse::submitted(&run.review),
        }),
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────
