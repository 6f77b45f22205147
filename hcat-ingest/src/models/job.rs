//! Commit jobs and their structured error log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable job status
///
/// `Queued → Running` is the single-flight compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "rolled_back" => Some(JobStatus::RolledBack),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Statuses whose manifest may be rolled back (retry allowed after a
    /// partial rollback leaves the job in its prior status)
    pub fn is_rollbackable(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage at which a row (or the job) failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStage {
    /// Row carried validation or structural errors and was never attempted
    Validation,
    RecordCreate,
    AssetImport,
    /// An ancestor failed or was excluded
    DependencyUnresolved,
    /// Store connectivity loss; remaining rows abandoned
    Fatal,
    Rollback,
}

impl CommitStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStage::Validation => "validation",
            CommitStage::RecordCreate => "record_create",
            CommitStage::AssetImport => "asset_import",
            CommitStage::DependencyUnresolved => "dependency_unresolved",
            CommitStage::Fatal => "fatal",
            CommitStage::Rollback => "rollback",
        }
    }
}

/// Row-scoped commit failure; logged and skipped
#[derive(Debug, Clone, thiserror::Error)]
#[error("{} failed: {message}", stage.as_str())]
pub struct RowCommitError {
    pub stage: CommitStage,
    pub message: String,
}

impl RowCommitError {
    pub fn new(stage: CommitStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

/// Entry of the job's structured error log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrorEntry {
    /// `None` for job-level entries (fatal abort)
    pub row_index: Option<usize>,
    pub stage: CommitStage,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestJob {
    pub id: Uuid,
    pub session_id: Uuid,
    pub status: JobStatus,
    pub total_rows: usize,
    pub processed_rows: usize,
    pub created_records: usize,
    pub created_assets: usize,
    pub error_count: usize,
    pub error_log: Vec<JobErrorEntry>,
    /// Exported manifest path, set when the job finishes
    pub manifest_ref: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IngestJob {
    pub fn new(session_id: Uuid, total_rows: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            status: JobStatus::Queued,
            total_rows,
            processed_rows: 0,
            created_records: 0,
            created_assets: 0,
            error_count: 0,
            error_log: Vec::new(),
            manifest_ref: None,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Reporting label; `completed` with errors is not a distinct status
    pub fn outcome(&self) -> &'static str {
        match self.status {
            JobStatus::Completed if self.error_count > 0 => "completed_with_errors",
            status => status.as_str(),
        }
    }

    pub fn record_error(&mut self, row_index: Option<usize>, error: &RowCommitError) {
        self.error_count += 1;
        self.error_log.push(JobErrorEntry {
            row_index,
            stage: error.stage,
            message: error.message.clone(),
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_label() {
        let mut job = IngestJob::new(Uuid::new_v4(), 3);
        job.status = JobStatus::Completed;
        assert_eq!(job.outcome(), "completed");

        job.record_error(Some(2), &RowCommitError::new(CommitStage::Validation, "title missing"));
        assert_eq!(job.outcome(), "completed_with_errors");
        assert_eq!(job.error_count, 1);
        assert_eq!(job.error_log[0].row_index, Some(2));
    }

    #[test]
    fn test_status_round_trip() {
        assert_eq!(JobStatus::parse("rolled_back"), Some(JobStatus::RolledBack));
        assert!(JobStatus::Cancelled.is_rollbackable());
        assert!(!JobStatus::Running.is_finished());
    }
}
