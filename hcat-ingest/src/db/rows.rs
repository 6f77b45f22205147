//! Uploaded source rows

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::Result;
use crate::models::SourceRow;

/// Replace a session's stored rows
pub async fn replace_rows(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    rows: &[SourceRow],
) -> Result<()> {
    let session_id = session_id.to_string();

    sqlx::query("DELETE FROM ingest_rows WHERE session_id = ?")
        .bind(&session_id)
        .execute(&mut *conn)
        .await?;

    for row in rows {
        sqlx::query("INSERT INTO ingest_rows (session_id, row_index, data) VALUES (?, ?, ?)")
            .bind(&session_id)
            .bind(row.index as i64)
            .bind(serde_json::to_string(&row.values)?)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

/// Rows in source order, excluded ones included
pub async fn load_rows(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<SourceRow>> {
    let rows = sqlx::query(
        r#"
        SELECT row_index, data, excluded, fixes
        FROM ingest_rows
        WHERE session_id = ?
        ORDER BY row_index
        "#,
    )
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_from_record).collect()
}

pub async fn load_row(
    pool: &SqlitePool,
    session_id: Uuid,
    row_index: usize,
) -> Result<Option<SourceRow>> {
    let row = sqlx::query(
        r#"
        SELECT row_index, data, excluded, fixes
        FROM ingest_rows
        WHERE session_id = ? AND row_index = ?
        "#,
    )
    .bind(session_id.to_string())
    .bind(row_index as i64)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_from_record).transpose()
}

/// Store a row's operator edits (exclusion flag and field fixes)
pub async fn update_edits(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    row: &SourceRow,
) -> Result<()> {
    sqlx::query(
        "UPDATE ingest_rows SET excluded = ?, fixes = ? WHERE session_id = ? AND row_index = ?",
    )
    .bind(row.excluded)
    .bind(serde_json::to_string(&row.fixes)?)
    .bind(session_id.to_string())
    .bind(row.index as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn row_from_record(row: &SqliteRow) -> Result<SourceRow> {
    let data: String = row.get("data");
    let fixes: String = row.get("fixes");
    let values: BTreeMap<String, String> = serde_json::from_str(&data)?;
    Ok(SourceRow {
        excluded: row.get("excluded"),
        fixes: serde_json::from_str(&fixes)?,
        ..SourceRow::new(row.get::<i64, _>("row_index") as usize, values)
    })
}
