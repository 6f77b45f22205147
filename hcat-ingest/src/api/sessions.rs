//! Session API handlers
//!
//! POST/GET /sessions, then one route per workflow step. Every handler looks
//! the session up by id; there is no implicit current session. Row edits and
//! saved mapping profiles live here too.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{
    FieldMapping, FindingSummary, IngestJob, IngestSession, MappingOverride, MappingProfile,
    SessionConfig, Severity, SourceRow, ValidationFinding,
};
use crate::services::mapping_engine::unresolved_columns;
use crate::services::PreviewTree;
use crate::AppState;

/// Upload payload limit
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// GET /sessions/:id response
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub session: IngestSession,
    pub jobs: Vec<IngestJob>,
}

/// POST /sessions/:id/upload query
#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub file_name: String,
    /// Defaults to the file name's extension
    pub format: Option<String>,
}

/// Mapping set with its unresolved columns
#[derive(Debug, Serialize)]
pub struct MappingResponse {
    pub mappings: Vec<FieldMapping>,
    pub unresolved: Vec<String>,
}

impl From<Vec<FieldMapping>> for MappingResponse {
    fn from(mappings: Vec<FieldMapping>) -> Self {
        let unresolved = unresolved_columns(&mappings);
        Self {
            mappings,
            unresolved,
        }
    }
}

/// PUT /sessions/:id/mappings request
#[derive(Debug, Deserialize)]
pub struct SetMappingRequest {
    pub overrides: Vec<MappingOverride>,
}

/// POST /sessions/:id/validate request (optional body)
#[derive(Debug, Default, Deserialize)]
pub struct ValidateRequest {
    #[serde(default)]
    pub accept_unresolved: bool,
}

#[derive(Debug, Serialize)]
pub struct ValidationResponse {
    pub summary: FindingSummary,
    pub findings: Vec<ValidationFinding>,
}

#[derive(Debug, Deserialize)]
pub struct FindingsQuery {
    pub severity: Option<String>,
}

/// POST /sessions/:id/profiles request
#[derive(Debug, Deserialize)]
pub struct SaveProfileRequest {
    pub name: String,
}

/// POST /sessions/:id/rows/:row/exclude request (optional body)
#[derive(Debug, Deserialize)]
pub struct ExcludeRowRequest {
    /// `false` puts the row back into the batch
    #[serde(default = "default_true")]
    pub excluded: bool,
}

impl Default for ExcludeRowRequest {
    fn default() -> Self {
        Self { excluded: true }
    }
}

/// PUT /sessions/:id/rows/:row/fixes request
#[derive(Debug, Deserialize)]
pub struct FixRowRequest {
    pub field: String,
    /// Empty clears the field for this row
    #[serde(default)]
    pub value: String,
}

/// POST /sessions/:id/jobs request (optional body)
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    /// Dispatch the job right away (default) or leave it queued
    #[serde(default = "default_true")]
    pub start: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CreateJobRequest {
    fn default() -> Self {
        Self { start: true }
    }
}

/// POST /sessions
pub async fn create_session(
    State(state): State<AppState>,
    Json(config): Json<SessionConfig>,
) -> ApiResult<(StatusCode, Json<IngestSession>)> {
    let session = state.sessions.create(config).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /sessions
pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<IngestSession>>> {
    Ok(Json(state.sessions.list().await?))
}

/// GET /sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<SessionResponse>> {
    let session = state.sessions.get(session_id).await?;
    let jobs = state.sessions.jobs(session_id).await?;
    Ok(Json(SessionResponse { session, jobs }))
}

/// DELETE /sessions/:id
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.sessions.delete(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /sessions/:id/upload?file_name=…[&format=…]
///
/// Body is the raw payload.
pub async fn upload_source(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ApiResult<Json<IngestSession>> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty upload".to_string()));
    }
    let session = state
        .sessions
        .upload(session_id, &params.file_name, params.format.as_deref(), &body)
        .await?;
    Ok(Json(session))
}

/// POST /sessions/:id/map
pub async fn auto_map(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<MappingResponse>> {
    Ok(Json(state.sessions.auto_map(session_id).await?.into()))
}

/// GET /sessions/:id/mappings
pub async fn get_mappings(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<MappingResponse>> {
    Ok(Json(state.sessions.mappings(session_id).await?.into()))
}

/// PUT /sessions/:id/mappings
pub async fn set_mappings(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<SetMappingRequest>,
) -> ApiResult<Json<MappingResponse>> {
    let mappings = state
        .sessions
        .set_mapping(session_id, &request.overrides)
        .await?;
    Ok(Json(mappings.into()))
}

/// POST /sessions/:id/validate
///
/// 422 MAPPING_AMBIGUITY while columns are unresolved, unless the body
/// sets `accept_unresolved`.
pub async fn validate(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    request: Option<Json<ValidateRequest>>,
) -> ApiResult<Json<ValidationResponse>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let findings = state
        .sessions
        .validate(session_id, request.accept_unresolved)
        .await?;
    Ok(Json(ValidationResponse {
        summary: FindingSummary::from_findings(&findings),
        findings,
    }))
}

/// GET /profiles
pub async fn list_profiles(State(state): State<AppState>) -> ApiResult<Json<Vec<MappingProfile>>> {
    Ok(Json(state.sessions.list_mapping_profiles().await?))
}

/// POST /sessions/:id/profiles
pub async fn save_profile(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<SaveProfileRequest>,
) -> ApiResult<(StatusCode, Json<MappingProfile>)> {
    let profile = state
        .sessions
        .save_mapping_profile(session_id, &request.name)
        .await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

/// POST /sessions/:id/profiles/:profile_id/apply
pub async fn apply_profile(
    State(state): State<AppState>,
    Path((session_id, profile_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<MappingResponse>> {
    let mappings = state
        .sessions
        .apply_mapping_profile(session_id, profile_id)
        .await?;
    Ok(Json(mappings.into()))
}

/// POST /sessions/:id/rows/:row/exclude
pub async fn exclude_row(
    State(state): State<AppState>,
    Path((session_id, row_index)): Path<(Uuid, usize)>,
    request: Option<Json<ExcludeRowRequest>>,
) -> ApiResult<Json<SourceRow>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let row = state
        .sessions
        .exclude_row(session_id, row_index, request.excluded)
        .await?;
    Ok(Json(row))
}

/// PUT /sessions/:id/rows/:row/fixes
pub async fn fix_row(
    State(state): State<AppState>,
    Path((session_id, row_index)): Path<(Uuid, usize)>,
    Json(request): Json<FixRowRequest>,
) -> ApiResult<Json<SourceRow>> {
    let row = state
        .sessions
        .fix_row(session_id, row_index, &request.field, &request.value)
        .await?;
    Ok(Json(row))
}

/// GET /sessions/:id/findings[?severity=error|warning]
pub async fn get_findings(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<FindingsQuery>,
) -> ApiResult<Json<Vec<ValidationFinding>>> {
    let severity = match query.severity.as_deref() {
        Some(s) => Some(
            Severity::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown severity '{}'", s)))?,
        ),
        None => None,
    };
    Ok(Json(state.sessions.findings(session_id, severity).await?))
}

/// GET /sessions/:id/preview
pub async fn get_preview(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<PreviewTree>> {
    Ok(Json(state.sessions.preview(session_id).await?))
}

/// POST /sessions/:id/cancel
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<IngestSession>> {
    Ok(Json(state.sessions.cancel(session_id).await?))
}

/// POST /sessions/:id/jobs
///
/// Creates the commit job and, unless `start` is false, dispatches it.
/// Returns 202 with the queued job.
pub async fn create_job(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    request: Option<Json<CreateJobRequest>>,
) -> ApiResult<(StatusCode, Json<IngestJob>)> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let job = state.sessions.create_job(session_id).await?;

    if request.start {
        if let Err(e) = state.queue.enqueue(job.id).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to dispatch job");
            *state.last_error.write().await = Some(e.to_string());
            return Err(e.into());
        }
    }

    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// Build session routes
pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route(
            "/sessions/:id/upload",
            post(upload_source).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/sessions/:id/map", post(auto_map))
        .route("/sessions/:id/mappings", get(get_mappings).put(set_mappings))
        .route("/profiles", get(list_profiles))
        .route("/sessions/:id/profiles", post(save_profile))
        .route("/sessions/:id/profiles/:profile_id/apply", post(apply_profile))
        .route("/sessions/:id/rows/:row/exclude", post(exclude_row))
        .route("/sessions/:id/rows/:row/fixes", put(fix_row))
        .route("/sessions/:id/validate", post(validate))
        .route("/sessions/:id/findings", get(get_findings))
        .route("/sessions/:id/preview", get(get_preview))
        .route("/sessions/:id/cancel", post(cancel_session))
        .route("/sessions/:id/jobs", post(create_job))
}
