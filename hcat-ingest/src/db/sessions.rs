//! Ingest session persistence
//!
//! State changes go through [`transition`], a compare-and-set on the
//! persisted state, so callers always act on the state they observed.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{corrupt, parse_timestamp, parse_uuid};
use crate::error::{IngestError, Result};
use crate::models::{IngestSession, SessionState, SourceDescriptor};

const SESSION_COLUMNS: &str = "id, state, config, source, headers, total_rows, accept_unresolved, created_at, updated_at";

pub async fn insert_session<'e, E>(executor: E, session: &IngestSession) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let config = serde_json::to_string(&session.config)?;
    let source = session.source.as_ref().map(serde_json::to_string).transpose()?;
    let headers = serde_json::to_string(&session.headers)?;

    sqlx::query(
        r#"
        INSERT INTO ingest_sessions (
            id, state, config, source, headers, total_rows,
            accept_unresolved, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(session.id.to_string())
    .bind(session.state.as_str())
    .bind(&config)
    .bind(&source)
    .bind(&headers)
    .bind(session.total_rows as i64)
    .bind(session.accept_unresolved)
    .bind(session.created_at.to_rfc3339())
    .bind(session.updated_at.to_rfc3339())
    .execute(executor)
    .await?;

    Ok(())
}

fn session_from_row(row: &SqliteRow) -> Result<IngestSession> {
    let id: String = row.get("id");
    let state: String = row.get("state");
    let config: String = row.get("config");
    let source: Option<String> = row.get("source");
    let headers: String = row.get("headers");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(IngestSession {
        id: parse_uuid("id", &id)?,
        state: SessionState::parse(&state).ok_or_else(|| corrupt("state", &state))?,
        config: serde_json::from_str(&config)?,
        source: source
            .as_deref()
            .map(serde_json::from_str::<SourceDescriptor>)
            .transpose()?,
        headers: serde_json::from_str(&headers)?,
        total_rows: row.get::<i64, _>("total_rows") as usize,
        accept_unresolved: row.get("accept_unresolved"),
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

pub async fn load_session<'e, E>(executor: E, session_id: Uuid) -> Result<Option<IngestSession>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!(
        "SELECT {} FROM ingest_sessions WHERE id = ?",
        SESSION_COLUMNS
    ))
    .bind(session_id.to_string())
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(session_from_row).transpose()
}

/// All sessions, newest first
pub async fn list_sessions(pool: &SqlitePool) -> Result<Vec<IngestSession>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM ingest_sessions ORDER BY created_at DESC, id",
        SESSION_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(session_from_row).collect()
}

/// Compare-and-set the session state
///
/// Fails with `Precondition` if the persisted state is no longer `from`
/// (another caller moved the session first).
pub async fn transition(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    from: SessionState,
    to: SessionState,
) -> Result<()> {
    if from != to && !from.can_transition(to) {
        return Err(IngestError::Precondition(format!(
            "session cannot move from {} to {}",
            from, to
        )));
    }

    let result = sqlx::query(
        "UPDATE ingest_sessions SET state = ?, updated_at = ? WHERE id = ? AND state = ?",
    )
    .bind(to.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(session_id.to_string())
    .bind(from.as_str())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(IngestError::Precondition(format!(
            "session {} is no longer {}",
            session_id, from
        )));
    }
    Ok(())
}

/// Record the uploaded source descriptor and header list
pub async fn update_source(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    source: &SourceDescriptor,
    headers: &[String],
    total_rows: usize,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE ingest_sessions
        SET source = ?, headers = ?, total_rows = ?, accept_unresolved = 0, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(serde_json::to_string(source)?)
    .bind(serde_json::to_string(headers)?)
    .bind(total_rows as i64)
    .bind(Utc::now().to_rfc3339())
    .bind(session_id.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn set_accept_unresolved(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    accept: bool,
) -> Result<()> {
    sqlx::query("UPDATE ingest_sessions SET accept_unresolved = ? WHERE id = ?")
        .bind(accept)
        .bind(session_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Delete a session; rows, mappings, findings, jobs and manifests cascade
pub async fn delete_session<'e, E>(executor: E, session_id: Uuid) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM ingest_sessions WHERE id = ?")
        .bind(session_id.to_string())
        .execute(executor)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Terminal sessions last touched before `cutoff`
pub async fn expired_sessions(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
    let terminal = [
        SessionState::Completed,
        SessionState::Failed,
        SessionState::Cancelled,
        SessionState::RolledBack,
    ];

    let rows = sqlx::query("SELECT id, state, updated_at FROM ingest_sessions ORDER BY created_at")
        .fetch_all(pool)
        .await?;

    let mut expired = Vec::new();
    for row in rows {
        let state: String = row.get("state");
        let updated_at: String = row.get("updated_at");
        let is_terminal = SessionState::parse(&state)
            .map(|s| terminal.contains(&s))
            .unwrap_or(false);
        if is_terminal && parse_timestamp("updated_at", &updated_at)? < cutoff {
            let id: String = row.get("id");
            expired.push(parse_uuid("id", &id)?);
        }
    }
    Ok(expired)
}
