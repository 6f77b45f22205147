//! Saved mapping profiles (not tied to any session)

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{parse_timestamp, parse_uuid};
use crate::error::Result;
use crate::models::MappingProfile;

/// Insert a profile, or replace the entries of the one with the same name
///
/// Returns the stored profile; on replacement it keeps the existing id and
/// creation time.
pub async fn save_profile(pool: &SqlitePool, profile: &MappingProfile) -> Result<MappingProfile> {
    sqlx::query(
        r#"
        INSERT INTO ingest_mapping_profiles (id, name, standard, entries, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(name) DO UPDATE SET
            standard = excluded.standard,
            entries = excluded.entries,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(profile.id.to_string())
    .bind(&profile.name)
    .bind(&profile.standard)
    .bind(serde_json::to_string(&profile.entries)?)
    .bind(profile.created_at.to_rfc3339())
    .bind(profile.updated_at.to_rfc3339())
    .execute(pool)
    .await?;

    let row = sqlx::query("SELECT * FROM ingest_mapping_profiles WHERE name = ?")
        .bind(&profile.name)
        .fetch_one(pool)
        .await?;
    profile_from_row(&row)
}

pub async fn load_profile(pool: &SqlitePool, profile_id: Uuid) -> Result<Option<MappingProfile>> {
    let row = sqlx::query("SELECT * FROM ingest_mapping_profiles WHERE id = ?")
        .bind(profile_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(profile_from_row).transpose()
}

/// All profiles, by name
pub async fn list_profiles(pool: &SqlitePool) -> Result<Vec<MappingProfile>> {
    let rows = sqlx::query("SELECT * FROM ingest_mapping_profiles ORDER BY name")
        .fetch_all(pool)
        .await?;
    rows.iter().map(profile_from_row).collect()
}

fn profile_from_row(row: &SqliteRow) -> Result<MappingProfile> {
    let id: String = row.get("id");
    let entries: String = row.get("entries");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(MappingProfile {
        id: parse_uuid("id", &id)?,
        name: row.get("name"),
        standard: row.get("standard"),
        entries: serde_json::from_str(&entries)?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}
