// evolution-api-rs/src/lib.rs
// Operator HTTP API for the prompt evolution pipeline.
//
// Read endpoints expose the version store and the run ledger. `POST /runs`
// opens a run and executes it in the background; `POST /approve` is the
// manual override over the same activate/reject operations the pipeline uses,
// and `POST /rollback` restores the content of a superseded version.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use prompt_evolution::{PipelineOrchestrator, RunRequest};
use serde::{Deserialize, Serialize};
use shared_types::{
    PerformanceTotals, PipelineRun, PromptVersion, RunMode, RunSummary, RunTrigger, TimeWindow,
    WindowPerformance,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod error;
pub mod logging;
pub mod scheduler;


pub use error::{ApiError, ErrorResponse};

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub const SERVICE_NAME: &str = "evolution-api";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PipelineOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>) -> Self {
        Lazy::force(&START_TIME);
        Self { orchestrator }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub service_name: String,
    pub uptime_seconds: u64,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub active_version: Option<String>,
    pub pending_candidates: usize,
    pub total_runs: usize,
    pub open_runs: usize,
    pub success_rate: f64,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Body of `POST /api/v1/runs`.
#[derive(Debug, Deserialize)]
pub struct StartRunBody {
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub window: Option<TimeWindow>,
    #[serde(default)]
    pub candidate_version: Option<String>,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRunResponse {
    pub run_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub run_id: String,
    pub cancel_requested: bool,
}

/// Body of `POST /api/v1/approve`.
#[derive(Debug, Deserialize)]
pub struct ApproveBody {
    pub version_id: String,
    pub approved: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Body of `POST /api/v1/rollback`.
#[derive(Debug, Deserialize)]
pub struct RollbackBody {
    pub version_id: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PerformanceResponse {
    pub version_id: String,
    pub totals: PerformanceTotals,
    pub windows: Vec<WindowPerformance>,
}

type ApiResult<T> = Result<T, ApiError>;

/// Create the Axum router with all routes and middleware
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/history", get(history_handler))
        .route("/api/v1/runs", post(start_run_handler))
        .route("/api/v1/runs/:run_id", get(get_run_handler))
        .route("/api/v1/runs/:run_id/cancel", post(cancel_run_handler))
        .route("/api/v1/versions", get(versions_handler))
        .route("/api/v1/versions/current", get(current_version_handler))
        .route("/api/v1/versions/candidates", get(candidates_handler))
        .route("/api/v1/diff/:version_id", get(diff_handler))
        .route("/api/v1/performance/:version_id", get(performance_handler))
        .route("/api/v1/approve", post(approve_handler))
        .route("/api/v1/rollback", post(rollback_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        service_name: SERVICE_NAME.to_string(),
        uptime_seconds: START_TIME.elapsed().as_secs(),
        status: "SERVING".to_string(),
    })
}

async fn status_handler(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let store = state.orchestrator.store();
    let active = store.get_active().await?;
    let pending = store.pending_candidates().await?;
    let stats = state.orchestrator.ledger().stats().await?;

    Ok(Json(StatusResponse {
        active_version: active.map(|v| v.version_id),
        pending_candidates: pending.len(),
        total_runs: stats.total_runs,
        open_runs: stats.open_runs,
        success_rate: stats.success_rate,
        last_run_at: stats.last_run_at,
    }))
}

async fn history_handler(State(state): State<AppState>) -> ApiResult<Json<Vec<RunSummary>>> {
    let runs = state.orchestrator.ledger().list_runs().await?;
    Ok(Json(runs.iter().map(PipelineRun::summary).collect()))
}

async fn get_run_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<PipelineRun>> {
    state
        .orchestrator
        .ledger()
        .get(&run_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("run {run_id}")))
}

async fn start_run_handler(
    State(state): State<AppState>,
    Json(body): Json<StartRunBody>,
) -> ApiResult<impl IntoResponse> {
    let request = RunRequest {
        mode: body.mode,
        trigger: RunTrigger::Manual,
        triggered_by: body.triggered_by.unwrap_or_else(|| "api".to_string()),
        window: body.window,
        candidate_version: body.candidate_version,
    };
    let ticket = state.orchestrator.start(request).await?;
    let run_id = ticket.run_id.clone();

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        let run_id = ticket.run_id.clone();
        if let Err(err) = orchestrator.execute(ticket).await {
            tracing::error!(run_id = %run_id, error = %err, "background pipeline run aborted");
        }
    });

    tracing::info!(run_id = %run_id, mode = body.mode.as_str(), "pipeline run accepted");
    Ok((StatusCode::ACCEPTED, Json(StartRunResponse { run_id })))
}

async fn cancel_run_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if state.orchestrator.cancel(&run_id).await {
        return Ok((
            StatusCode::ACCEPTED,
            Json(CancelResponse {
                run_id,
                cancel_requested: true,
            }),
        ));
    }
    match state.orchestrator.ledger().get(&run_id).await? {
        Some(_) => Err(ApiError::NotInFlight(run_id)),
        None => Err(ApiError::NotFound(format!("run {run_id}"))),
    }
}

async fn versions_handler(State(state): State<AppState>) -> ApiResult<Json<Vec<PromptVersion>>> {
    Ok(Json(state.orchestrator.store().list_history().await?))
}

async fn current_version_handler(State(state): State<AppState>) -> ApiResult<Json<PromptVersion>> {
    state
        .orchestrator
        .store()
        .get_active()
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("active version".to_string()))
}

async fn candidates_handler(State(state): State<AppState>) -> ApiResult<Json<Vec<PromptVersion>>> {
    Ok(Json(state.orchestrator.store().pending_candidates().await?))
}

async fn diff_handler(
    State(state): State<AppState>,
    Path(version_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let diff = state
        .orchestrator
        .store()
        .diff_against_active(&version_id)
        .await?;
    Ok(Json(diff))
}

async fn approve_handler(
    State(state): State<AppState>,
    Json(body): Json<ApproveBody>,
) -> ApiResult<Json<PromptVersion>> {
    let store = state.orchestrator.store();
    let verdict = if body.approved { "approved" } else { "rejected" };
    let reason = match body.notes.as_deref().map(str::trim) {
        Some(notes) if !notes.is_empty() => format!("manually {verdict}: {notes}"),
        _ => format!("manually {verdict}"),
    };

    let version = if body.approved {
        store.activate(&body.version_id, &reason).await?
    } else {
        store.reject(&body.version_id, &reason).await?
    };
    metrics::increment_counter!("manual_overrides_total", "verdict" => verdict);
    tracing::info!(version_id = %version.version_id, verdict, "manual override applied");
    Ok(Json(version))
}

async fn rollback_handler(
    State(state): State<AppState>,
    Json(body): Json<RollbackBody>,
) -> ApiResult<Json<PromptVersion>> {
    let reason = match body.notes.as_deref().map(str::trim) {
        Some(notes) if !notes.is_empty() => notes.to_string(),
        _ => "manual rollback".to_string(),
    };
    let requested_by = body.requested_by.unwrap_or_else(|| "api".to_string());
    let version = state
        .orchestrator
        .store()
        .rollback_to(&body.version_id, &reason, &requested_by)
        .await?;
    tracing::info!(
        version_id = %version.version_id,
        restored_from = %body.version_id,
        "manual rollback applied"
    );
    Ok(Json(version))
}

async fn performance_handler(
    State(state): State<AppState>,
    Path(version_id): Path<String>,
) -> ApiResult<Json<PerformanceResponse>> {
    let performance = state.orchestrator.store().performance(&version_id).await?;
    Ok(Json(PerformanceResponse {
        totals: performance.totals(),
        windows: performance.windows.into_values().collect(),
        version_id: performance.version_id,
    }))
}
