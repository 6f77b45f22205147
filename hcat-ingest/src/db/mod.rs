//! Durable pipeline state
//!
//! Sessions, source rows, mappings, findings, jobs and manifest entries live
//! in `hcat-ingest.db` under the root folder. Child tables cascade on session
//! (and job) deletion. Saved mapping profiles belong to no session and
//! outlive them.

pub mod findings;
pub mod jobs;
pub mod manifest;
pub mod mappings;
pub mod profiles;
pub mod rows;
pub mod sessions;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::path::Path;

use crate::error::{IngestError, Result};

/// Open (creating if needed) the pipeline database and its tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    let pool = hcat_common::db::open_database(db_path).await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Private in-memory pipeline database (tests, dry runs)
pub async fn init_in_memory() -> Result<SqlitePool> {
    let pool = hcat_common::db::open_in_memory().await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create pipeline tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_sessions (
            id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            config TEXT NOT NULL,
            source TEXT,
            headers TEXT NOT NULL DEFAULT '[]',
            total_rows INTEGER NOT NULL DEFAULT 0,
            accept_unresolved INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_rows (
            session_id TEXT NOT NULL REFERENCES ingest_sessions(id) ON DELETE CASCADE,
            row_index INTEGER NOT NULL,
            data TEXT NOT NULL,
            excluded INTEGER NOT NULL DEFAULT 0,
            fixes TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (session_id, row_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_mappings (
            session_id TEXT NOT NULL REFERENCES ingest_sessions(id) ON DELETE CASCADE,
            source_column TEXT NOT NULL,
            position INTEGER NOT NULL,
            target_field TEXT,
            confidence REAL NOT NULL,
            transform TEXT,
            default_value TEXT,
            manual_override INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            candidates TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (session_id, source_column)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_mapping_profiles (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            standard TEXT NOT NULL,
            entries TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_findings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES ingest_sessions(id) ON DELETE CASCADE,
            row_index INTEGER NOT NULL,
            field_id TEXT,
            severity TEXT NOT NULL,
            code TEXT NOT NULL,
            message TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_jobs (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES ingest_sessions(id) ON DELETE CASCADE,
            status TEXT NOT NULL,
            total_rows INTEGER NOT NULL,
            processed_rows INTEGER NOT NULL DEFAULT 0,
            created_records INTEGER NOT NULL DEFAULT 0,
            created_assets INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            error_log TEXT NOT NULL DEFAULT '[]',
            manifest_ref TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_manifest (
            job_id TEXT NOT NULL REFERENCES ingest_jobs(id) ON DELETE CASCADE,
            seq INTEGER NOT NULL,
            row_index INTEGER NOT NULL,
            record_id TEXT NOT NULL,
            parent_record_id TEXT,
            action TEXT NOT NULL,
            assets TEXT NOT NULL DEFAULT '[]',
            state TEXT NOT NULL,
            PRIMARY KEY (job_id, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_ingest_findings_session ON ingest_findings(session_id, row_index)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_ingest_jobs_session ON ingest_jobs(session_id)")
        .execute(pool)
        .await?;

    tracing::info!("Database tables initialized (ingest_sessions, ingest_rows, ingest_mappings, ingest_mapping_profiles, ingest_findings, ingest_jobs, ingest_manifest)");

    Ok(())
}

pub(crate) fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| IngestError::Common(hcat_common::Error::Internal(format!(
            "Failed to parse {}: {}",
            column, e
        ))))
}

pub(crate) fn parse_uuid(column: &str, value: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(value).map_err(|e| {
        IngestError::Common(hcat_common::Error::Internal(format!(
            "Failed to parse {}: {}",
            column, e
        )))
    })
}

pub(crate) fn corrupt(column: &str, value: &str) -> IngestError {
    IngestError::Common(hcat_common::Error::Internal(format!(
        "Unrecognised {} value '{}'",
        column, value
    )))
}
