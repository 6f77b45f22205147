//! Commit job lifecycle: single-flight start, cancellation, rollback
//!
//! A job runs only after winning the `queued → running` compare-and-set in
//! the database. Every other start attempt (a concurrent caller, or a task
//! queue redelivering the job) observes `AlreadyRunning` or a finished job
//! and does nothing.

use chrono::Utc;
use hcat_common::events::{EventBus, IngestEvent};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db;
use crate::error::{IngestError, Result};
use crate::models::{IngestJob, JobStatus, ManifestDocument, SessionState};
use crate::services::commit_executor::{CommitExecutor, RollbackReport};

/// In-process cancellation tokens of running jobs
pub type CancellationTokens = Arc<RwLock<HashMap<Uuid, CancellationToken>>>;

/// Result of a start attempt
#[derive(Debug)]
pub enum StartOutcome {
    /// This caller ran the job to its final status
    Finished(IngestJob),
    /// Another execution holds the job
    AlreadyRunning,
}

#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(IngestJob),
    AlreadyRunning,
}

pub struct JobRunner {
    db: SqlitePool,
    executor: Arc<CommitExecutor>,
    event_bus: EventBus,
    tokens: CancellationTokens,
}

impl JobRunner {
    pub fn new(
        db: SqlitePool,
        executor: Arc<CommitExecutor>,
        event_bus: EventBus,
        tokens: CancellationTokens,
    ) -> Self {
        Self {
            db,
            executor,
            event_bus,
            tokens,
        }
    }

    pub async fn status(&self, job_id: Uuid) -> Result<IngestJob> {
        db::jobs::load_job(&self.db, job_id)
            .await?
            .ok_or_else(|| IngestError::job_not_found(job_id))
    }

    /// Win the `queued → running` transition or report why not
    pub async fn claim(&self, job_id: Uuid) -> Result<ClaimOutcome> {
        if !db::jobs::claim_job(&self.db, job_id).await? {
            let job = self.status(job_id).await?;
            return match job.status {
                JobStatus::Running => Ok(ClaimOutcome::AlreadyRunning),
                status => Err(IngestError::Precondition(format!(
                    "job {} is {} and cannot be started",
                    job_id, status
                ))),
            };
        }

        let job = self.status(job_id).await?;
        info!(job_id = %job_id, session_id = %job.session_id, "Job claimed");
        self.event_bus.emit_lossy(IngestEvent::JobStarted {
            job_id,
            session_id: job.session_id,
            timestamp: Utc::now(),
        });
        Ok(ClaimOutcome::Claimed(job))
    }

    /// Claim and execute a job in the calling task
    pub async fn run(&self, job_id: Uuid) -> Result<StartOutcome> {
        match self.claim(job_id).await? {
            ClaimOutcome::AlreadyRunning => {
                info!(job_id = %job_id, "Start rejected: job already running");
                Ok(StartOutcome::AlreadyRunning)
            }
            ClaimOutcome::Claimed(job) => self.execute_claimed(job).await.map(StartOutcome::Finished),
        }
    }

    /// Execute a job this caller claimed; see [`JobRunner::claim`]
    pub async fn execute_claimed(&self, job: IngestJob) -> Result<IngestJob> {
        let job_id = job.id;
        let token = CancellationToken::new();
        self.tokens.write().await.insert(job_id, token.clone());

        let result = self.executor.execute(job, token).await;
        self.tokens.write().await.remove(&job_id);

        match result {
            Ok(job) => Ok(job),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Commit could not complete");
                self.executor.fail_job(job_id, &e.to_string()).await?;
                self.status(job_id).await
            }
        }
    }

    /// Release a claim that could not be handed to a worker
    pub async fn abandon_claimed(&self, job_id: Uuid, reason: &str) -> Result<()> {
        warn!(job_id = %job_id, reason, "Claimed job abandoned");
        self.executor.fail_job(job_id, reason).await
    }

    /// Request cancellation
    ///
    /// A queued job is cancelled immediately. A running job stops before its
    /// next row; rows committed so far stay manifested.
    pub async fn cancel(&self, job_id: Uuid) -> Result<IngestJob> {
        let job = self.status(job_id).await?;

        if job.status == JobStatus::Queued
            && self.cancel_queued(&job).await?
        {
            return self.status(job_id).await;
        }

        match self.status(job_id).await?.status {
            JobStatus::Running => {
                db::jobs::request_cancel(&self.db, job_id).await?;
                if let Some(token) = self.tokens.read().await.get(&job_id) {
                    token.cancel();
                }
                info!(job_id = %job_id, "Cancellation requested");
                self.status(job_id).await
            }
            status => Err(IngestError::Precondition(format!(
                "job {} is {} and cannot be cancelled",
                job_id, status
            ))),
        }
    }

    async fn cancel_queued(&self, job: &IngestJob) -> Result<bool> {
        let mut tx = self.db.begin().await?;
        if !db::jobs::set_status(&mut *tx, job.id, JobStatus::Queued, JobStatus::Cancelled).await? {
            // Claimed in the meantime
            return Ok(false);
        }
        db::sessions::transition(
            &mut tx,
            job.session_id,
            SessionState::Committing,
            SessionState::Completed,
        )
        .await?;
        tx.commit().await?;

        info!(job_id = %job.id, "Queued job cancelled before start");
        self.event_bus.emit_lossy(IngestEvent::JobFinished {
            job_id: job.id,
            session_id: job.session_id,
            status: JobStatus::Cancelled.as_str().to_string(),
            created_records: 0,
            created_assets: 0,
            error_count: 0,
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    pub async fn rollback(&self, job_id: Uuid) -> Result<RollbackReport> {
        self.executor.rollback(job_id).await
    }

    /// Manifest as currently persisted (entry states included)
    pub async fn manifest(&self, job_id: Uuid) -> Result<ManifestDocument> {
        let job = self.status(job_id).await?;
        Ok(ManifestDocument {
            job_id,
            session_id: job.session_id,
            status: job.outcome().to_string(),
            exported_at: Utc::now(),
            entries: db::manifest::load_manifest(&self.db, job_id).await?,
        })
    }

    /// Mark jobs left `running` by a previous process as failed
    ///
    /// Their committed rows remain manifested and can be rolled back.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let interrupted = db::jobs::jobs_in_status(&self.db, JobStatus::Running).await?;
        for job in &interrupted {
            warn!(job_id = %job.id, "Job interrupted by restart; marking failed");
            self.executor
                .fail_job(job.id, "interrupted by service restart")
                .await?;
        }
        Ok(interrupted.len())
    }

    /// Jobs waiting for dispatch
    pub async fn queued_jobs(&self) -> Result<Vec<Uuid>> {
        Ok(db::jobs::jobs_in_status(&self.db, JobStatus::Queued)
            .await?
            .into_iter()
            .map(|j| j.id)
            .collect())
    }
}
