//! Validation findings, regenerated wholesale per validation run

use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::corrupt;
use crate::error::Result;
use crate::models::{Severity, ValidationFinding};

/// Replace a session's findings; insertion order is the reported order
pub async fn replace_findings(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    findings: &[ValidationFinding],
) -> Result<()> {
    clear_findings(conn, session_id).await?;

    for f in findings {
        sqlx::query(
            r#"
            INSERT INTO ingest_findings (session_id, row_index, field_id, severity, code, message)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id.to_string())
        .bind(f.row_index as i64)
        .bind(f.field_id.as_deref())
        .bind(f.severity.as_str())
        .bind(&f.code)
        .bind(&f.message)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

pub async fn clear_findings(conn: &mut SqliteConnection, session_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM ingest_findings WHERE session_id = ?")
        .bind(session_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Findings in reported order, optionally filtered by severity
pub async fn load_findings(
    pool: &SqlitePool,
    session_id: Uuid,
    severity: Option<Severity>,
) -> Result<Vec<ValidationFinding>> {
    let rows = sqlx::query(
        r#"
        SELECT row_index, field_id, severity, code, message
        FROM ingest_findings
        WHERE session_id = ? AND (? IS NULL OR severity = ?)
        ORDER BY id
        "#,
    )
    .bind(session_id.to_string())
    .bind(severity.map(|s| s.as_str()))
    .bind(severity.map(|s| s.as_str()))
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<ValidationFinding> {
            let severity: String = row.get("severity");
            Ok(ValidationFinding {
                session_id,
                row_index: row.get::<i64, _>("row_index") as usize,
                field_id: row.get("field_id"),
                severity: Severity::parse(&severity).ok_or_else(|| corrupt("severity", &severity))?,
                code: row.get("code"),
                message: row.get("message"),
            })
        })
        .collect()
}
