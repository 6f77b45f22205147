//! Job API handlers
//!
//! Status, start, cancel, rollback and manifest retrieval for commit jobs.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{IngestJob, ManifestDocument};
use crate::services::{ClaimOutcome, RollbackReport};
use crate::AppState;

/// GET /jobs/:id response
#[derive(Debug, Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: IngestJob,
    /// `completed_with_errors` when a completed job logged row errors
    pub outcome: &'static str,
}

impl From<IngestJob> for JobResponse {
    fn from(job: IngestJob) -> Self {
        let outcome = job.outcome();
        Self { job, outcome }
    }
}

/// GET /jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobResponse>> {
    Ok(Json(state.runner.status(job_id).await?.into()))
}

/// POST /jobs/:id/start
///
/// Claims a queued job here (`queued → running`) and hands it to a worker
/// (202). A second start finds the job running and gets 409 "already
/// running" without dispatching anything.
pub async fn start_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<JobResponse>)> {
    let job = match state.runner.claim(job_id).await? {
        ClaimOutcome::Claimed(job) => job,
        ClaimOutcome::AlreadyRunning => {
            return Err(ApiError::Conflict(format!("job {} is already running", job_id)))
        }
    };

    if let Err(e) = state.queue.dispatch_claimed(job.clone()).await {
        tracing::error!(job_id = %job_id, error = %e, "Failed to dispatch job");
        *state.last_error.write().await = Some(e.to_string());
        state.runner.abandon_claimed(job_id, &e.to_string()).await?;
        return Err(e.into());
    }
    Ok((StatusCode::ACCEPTED, Json(job.into())))
}

/// POST /jobs/:id/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobResponse>> {
    Ok(Json(state.runner.cancel(job_id).await?.into()))
}

/// POST /jobs/:id/rollback
///
/// 200 with the report even when some entries failed to revert; the job
/// keeps its status in that case and the call may be retried.
pub async fn rollback_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<RollbackReport>> {
    let report = state.runner.rollback(job_id).await?;
    if !report.failures.is_empty() {
        *state.last_error.write().await = Some(format!(
            "rollback of job {} left {} entries",
            job_id,
            report.failures.len()
        ));
    }
    Ok(Json(report))
}

/// GET /jobs/:id/manifest
pub async fn get_manifest(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<ManifestDocument>> {
    Ok(Json(state.runner.manifest(job_id).await?))
}

/// Build job routes
pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/start", post(start_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/rollback", post(rollback_job))
        .route("/jobs/:id/manifest", get(get_manifest))
}
