//! Column mappings (one active mapping per session and source column)

use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::corrupt;
use crate::error::Result;
use crate::models::{FieldMapping, MappingStatus, Transform};

/// Replace the whole mapping set for a session
pub async fn replace_mappings(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    mappings: &[FieldMapping],
) -> Result<()> {
    let session_id = session_id.to_string();

    sqlx::query("DELETE FROM ingest_mappings WHERE session_id = ?")
        .bind(&session_id)
        .execute(&mut *conn)
        .await?;

    for m in mappings {
        let transform = m.transform.map(|t| serde_json::to_string(&t)).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO ingest_mappings (
                session_id, source_column, position, target_field, confidence,
                transform, default_value, manual_override, status, candidates
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session_id)
        .bind(&m.source_column)
        .bind(m.position as i64)
        .bind(m.target_field.as_deref())
        .bind(m.confidence)
        .bind(transform.as_deref())
        .bind(m.default_value.as_deref())
        .bind(m.manual_override)
        .bind(m.status.as_str())
        .bind(serde_json::to_string(&m.candidates)?)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Mappings in column order
pub async fn load_mappings(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<FieldMapping>> {
    let rows = sqlx::query(
        r#"
        SELECT source_column, position, target_field, confidence, transform,
               default_value, manual_override, status, candidates
        FROM ingest_mappings
        WHERE session_id = ?
        ORDER BY position
        "#,
    )
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<FieldMapping> {
            let status: String = row.get("status");
            let transform: Option<String> = row.get("transform");
            let candidates: String = row.get("candidates");

            Ok(FieldMapping {
                session_id,
                source_column: row.get("source_column"),
                position: row.get::<i64, _>("position") as usize,
                target_field: row.get("target_field"),
                confidence: row.get("confidence"),
                transform: transform
                    .as_deref()
                    .map(serde_json::from_str::<Transform>)
                    .transpose()?,
                default_value: row.get("default_value"),
                manual_override: row.get("manual_override"),
                status: MappingStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
                candidates: serde_json::from_str(&candidates)?,
            })
        })
        .collect()
}
