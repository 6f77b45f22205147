//! Commit job persistence
//!
//! `claim_job` is the single-flight guard: a conditional `queued → running`
//! update whose affected-row count decides which caller runs the job.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use super::{corrupt, parse_timestamp, parse_uuid};
use crate::error::Result;
use crate::models::{IngestJob, JobStatus};

const JOB_COLUMNS: &str = "id, session_id, status, total_rows, processed_rows, created_records, \
     created_assets, error_count, error_log, manifest_ref, cancel_requested, created_at, \
     started_at, completed_at";

pub async fn insert_job<'e, E>(executor: E, job: &IngestJob) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO ingest_jobs (
            id, session_id, status, total_rows, processed_rows, created_records,
            created_assets, error_count, error_log, manifest_ref, cancel_requested,
            created_at, started_at, completed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(job.id.to_string())
    .bind(job.session_id.to_string())
    .bind(job.status.as_str())
    .bind(job.total_rows as i64)
    .bind(job.processed_rows as i64)
    .bind(job.created_records as i64)
    .bind(job.created_assets as i64)
    .bind(job.error_count as i64)
    .bind(serde_json::to_string(&job.error_log)?)
    .bind(job.manifest_ref.as_deref())
    .bind(job.cancel_requested)
    .bind(job.created_at.to_rfc3339())
    .bind(job.started_at.map(|t| t.to_rfc3339()))
    .bind(job.completed_at.map(|t| t.to_rfc3339()))
    .execute(executor)
    .await?;

    Ok(())
}

fn job_from_row(row: &SqliteRow) -> Result<IngestJob> {
    let id: String = row.get("id");
    let session_id: String = row.get("session_id");
    let status: String = row.get("status");
    let error_log: String = row.get("error_log");
    let created_at: String = row.get("created_at");
    let started_at: Option<String> = row.get("started_at");
    let completed_at: Option<String> = row.get("completed_at");

    Ok(IngestJob {
        id: parse_uuid("id", &id)?,
        session_id: parse_uuid("session_id", &session_id)?,
        status: JobStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        total_rows: row.get::<i64, _>("total_rows") as usize,
        processed_rows: row.get::<i64, _>("processed_rows") as usize,
        created_records: row.get::<i64, _>("created_records") as usize,
        created_assets: row.get::<i64, _>("created_assets") as usize,
        error_count: row.get::<i64, _>("error_count") as usize,
        error_log: serde_json::from_str(&error_log)?,
        manifest_ref: row.get("manifest_ref"),
        cancel_requested: row.get("cancel_requested"),
        created_at: parse_timestamp("created_at", &created_at)?,
        started_at: started_at
            .as_deref()
            .map(|s| parse_timestamp("started_at", s))
            .transpose()?,
        completed_at: completed_at
            .as_deref()
            .map(|s| parse_timestamp("completed_at", s))
            .transpose()?,
    })
}

pub async fn load_job<'e, E>(executor: E, job_id: Uuid) -> Result<Option<IngestJob>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!("SELECT {} FROM ingest_jobs WHERE id = ?", JOB_COLUMNS))
        .bind(job_id.to_string())
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Jobs of a session, oldest first
pub async fn jobs_for_session<'e, E>(executor: E, session_id: Uuid) -> Result<Vec<IngestJob>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(&format!(
        "SELECT {} FROM ingest_jobs WHERE session_id = ? ORDER BY created_at, id",
        JOB_COLUMNS
    ))
    .bind(session_id.to_string())
    .fetch_all(executor)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// Atomically move a job from `queued` to `running`
///
/// Returns `false` when the job was not `queued` (already claimed, finished
/// or missing); the caller must not execute it.
pub async fn claim_job(pool: &SqlitePool, job_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE ingest_jobs SET status = 'running', started_at = ? WHERE id = ? AND status = 'queued'",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(job_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Persist progress counters and the error log of a running job
pub async fn update_progress(pool: &SqlitePool, job: &IngestJob) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE ingest_jobs
        SET processed_rows = ?, created_records = ?, created_assets = ?,
            error_count = ?, error_log = ?
        WHERE id = ?
        "#,
    )
    .bind(job.processed_rows as i64)
    .bind(job.created_records as i64)
    .bind(job.created_assets as i64)
    .bind(job.error_count as i64)
    .bind(serde_json::to_string(&job.error_log)?)
    .bind(job.id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Write a job's final state, conditional on its current status
///
/// Returns `false` if the job was no longer in `from`.
pub async fn finish_job<'e, E>(executor: E, job: &IngestJob, from: JobStatus) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE ingest_jobs
        SET status = ?, processed_rows = ?, created_records = ?, created_assets = ?,
            error_count = ?, error_log = ?, manifest_ref = ?, completed_at = ?
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(job.status.as_str())
    .bind(job.processed_rows as i64)
    .bind(job.created_records as i64)
    .bind(job.created_assets as i64)
    .bind(job.error_count as i64)
    .bind(serde_json::to_string(&job.error_log)?)
    .bind(job.manifest_ref.as_deref())
    .bind(job.completed_at.map(|t| t.to_rfc3339()))
    .bind(job.id.to_string())
    .bind(from.as_str())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Set the durable cancellation flag (checked between rows)
pub async fn request_cancel(pool: &SqlitePool, job_id: Uuid) -> Result<bool> {
    let result = sqlx::query("UPDATE ingest_jobs SET cancel_requested = 1 WHERE id = ?")
        .bind(job_id.to_string())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn is_cancel_requested(pool: &SqlitePool, job_id: Uuid) -> Result<bool> {
    let flag: Option<bool> =
        sqlx::query_scalar("SELECT cancel_requested FROM ingest_jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(pool)
            .await?;
    Ok(flag.unwrap_or(false))
}

/// Compare-and-set a job status without touching counters
pub async fn set_status<'e, E>(
    executor: E,
    job_id: Uuid,
    from: JobStatus,
    to: JobStatus,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let completed_at = to.is_finished().then(|| Utc::now().to_rfc3339());
    let result = sqlx::query(
        r#"
        UPDATE ingest_jobs
        SET status = ?, completed_at = COALESCE(?, completed_at)
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(to.as_str())
    .bind(completed_at)
    .bind(job_id.to_string())
    .bind(from.as_str())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Jobs currently in `status`, oldest first
///
/// At startup `running` jobs are those left behind by a process that no
/// longer exists, and `queued` jobs still await dispatch.
pub async fn jobs_in_status(pool: &SqlitePool, status: JobStatus) -> Result<Vec<IngestJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM ingest_jobs WHERE status = ? ORDER BY created_at, id",
        JOB_COLUMNS
    ))
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}
