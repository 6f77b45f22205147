//! Error types for hcat-ingest
//!
//! `IngestError` is the pipeline taxonomy; `ApiError` maps it onto HTTP
//! responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::capabilities::{AssetStoreError, CatalogError, SourceError};

/// Pipeline error
#[derive(Debug, Error)]
pub enum IngestError {
    /// State-machine misuse; rejected locally and never retried
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Unresolved column mappings; operator must resolve or accept them
    #[error("Unresolved mappings for columns: {}", columns.join(", "))]
    MappingAmbiguity { columns: Vec<String> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Catalog store error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Asset store error: {0}")]
    AssetStore(#[from] AssetStoreError),

    /// Store connectivity loss; aborts the remaining job
    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Common error: {0}")]
    Common(#[from] hcat_common::Error),
}

impl IngestError {
    pub fn session_not_found(id: Uuid) -> Self {
        IngestError::NotFound(format!("session {}", id))
    }

    pub fn job_not_found(id: Uuid) -> Self {
        IngestError::NotFound(format!("job {}", id))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409) - precondition failure or job already running
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unprocessable (422) - mapping ambiguity awaiting resolution
    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Precondition(_) => ApiError::Conflict(err.to_string()),
            IngestError::MappingAmbiguity { .. } => ApiError::Unprocessable(err.to_string()),
            IngestError::NotFound(msg) => ApiError::NotFound(msg),
            IngestError::InvalidInput(msg) => ApiError::BadRequest(msg),
            IngestError::Source(ref source) => ApiError::BadRequest(source.to_string()),
            IngestError::Common(hcat_common::Error::NotFound(msg)) => ApiError::NotFound(msg),
            IngestError::Common(hcat_common::Error::InvalidInput(msg)) => {
                ApiError::BadRequest(msg)
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Unprocessable(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "MAPPING_AMBIGUITY", msg)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;
