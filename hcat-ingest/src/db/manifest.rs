//! Manifest entries (append-only during commit, consumed in reverse by rollback)

use sqlx::{Executor, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use super::{corrupt, parse_uuid};
use crate::error::Result;
use crate::models::{ManifestAction, ManifestAsset, ManifestEntry, ManifestEntryState};

pub async fn append_entry<'e, E>(executor: E, entry: &ManifestEntry) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO ingest_manifest (
            job_id, seq, row_index, record_id, parent_record_id, action, assets, state
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.job_id.to_string())
    .bind(entry.seq)
    .bind(entry.row_index as i64)
    .bind(entry.record_id.to_string())
    .bind(entry.parent_record_id.map(|id| id.to_string()))
    .bind(serde_json::to_string(&entry.action)?)
    .bind(serde_json::to_string(&entry.assets)?)
    .bind(entry.state.as_str())
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn set_entry_state<'e, E>(
    executor: E,
    job_id: Uuid,
    seq: i64,
    state: ManifestEntryState,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE ingest_manifest SET state = ? WHERE job_id = ? AND seq = ?")
        .bind(state.as_str())
        .bind(job_id.to_string())
        .bind(seq)
        .execute(executor)
        .await?;
    Ok(())
}

/// Replace an entry's asset list (assets are appended before each link)
pub async fn set_entry_assets<'e, E>(
    executor: E,
    job_id: Uuid,
    seq: i64,
    assets: &[ManifestAsset],
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE ingest_manifest SET assets = ? WHERE job_id = ? AND seq = ?")
        .bind(serde_json::to_string(assets)?)
        .bind(job_id.to_string())
        .bind(seq)
        .execute(executor)
        .await?;
    Ok(())
}

/// Entries in commit order
pub async fn load_manifest(pool: &SqlitePool, job_id: Uuid) -> Result<Vec<ManifestEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT seq, row_index, record_id, parent_record_id, action, assets, state
        FROM ingest_manifest
        WHERE job_id = ?
        ORDER BY seq
        "#,
    )
    .bind(job_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<ManifestEntry> {
            let record_id: String = row.get("record_id");
            let parent_record_id: Option<String> = row.get("parent_record_id");
            let action: String = row.get("action");
            let assets: String = row.get("assets");
            let state: String = row.get("state");

            Ok(ManifestEntry {
                job_id,
                seq: row.get("seq"),
                row_index: row.get::<i64, _>("row_index") as usize,
                record_id: parse_uuid("record_id", &record_id)?,
                parent_record_id: parent_record_id
                    .as_deref()
                    .map(|s| parse_uuid("parent_record_id", s))
                    .transpose()?,
                action: serde_json::from_str::<ManifestAction>(&action)?,
                assets: serde_json::from_str(&assets)?,
                state: ManifestEntryState::parse(&state).ok_or_else(|| corrupt("state", &state))?,
            })
        })
        .collect()
}
