//! hcat-ingest: staged catalog ingestion pipeline
//!
//! Library interface shared by the binary (CLI + HTTP service) and the
//! integration tests.

pub mod api;
pub mod capabilities;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult, IngestError, Result};

use axum::Router;
use chrono::{DateTime, Utc};
use hcat_common::events::EventBus;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use crate::capabilities::Capabilities;
use crate::config::IngestSettings;
use crate::services::{CancellationTokens, CommitExecutor, JobRunner, SessionManager, TaskQueue};

/// Wired pipeline services over one database
#[derive(Clone)]
pub struct Pipeline {
    pub sessions: Arc<SessionManager>,
    pub runner: Arc<JobRunner>,
    pub cancellation_tokens: CancellationTokens,
}

impl Pipeline {
    pub fn new(
        db: SqlitePool,
        caps: Capabilities,
        settings: IngestSettings,
        event_bus: EventBus,
        manifest_dir: PathBuf,
    ) -> Self {
        let cancellation_tokens: CancellationTokens = Arc::new(RwLock::new(HashMap::new()));
        let executor = Arc::new(CommitExecutor::new(
            db.clone(),
            caps.clone(),
            settings.clone(),
            event_bus.clone(),
            manifest_dir,
        ));
        let runner = Arc::new(JobRunner::new(
            db.clone(),
            executor,
            event_bus.clone(),
            cancellation_tokens.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(db, caps, settings, event_bus));

        Self {
            sessions,
            runner,
            cancellation_tokens,
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub sessions: Arc<SessionManager>,
    pub runner: Arc<JobRunner>,
    /// Dispatch for started jobs
    pub queue: Arc<dyn TaskQueue>,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Cancellation tokens of jobs running in this process
    pub cancellation_tokens: CancellationTokens,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last internal error, for diagnostics
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        pipeline: Pipeline,
        queue: Arc<dyn TaskQueue>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            db,
            sessions: pipeline.sessions,
            runner: pipeline.runner,
            queue,
            event_bus,
            cancellation_tokens: pipeline.cancellation_tokens,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::session_routes())
        .merge(api::job_routes())
        .route("/events", get(api::event_stream))
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
