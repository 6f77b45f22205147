//! SQLite-backed catalog store
//!
//! A minimal hierarchical catalog: records with an optional parent and a
//! unique source reference, plus linked asset rows. Foreign keys make
//! deleting a record with children or linked assets a constraint violation.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

use super::{CatalogError, CatalogRecord, CatalogStore, NewRecord, StoredAsset};

#[derive(Clone)]
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub async fn open(path: &Path) -> hcat_common::Result<Self> {
        let pool = hcat_common::db::open_database(path).await?;
        Self::from_pool(pool).await
    }

    pub async fn in_memory() -> hcat_common::Result<Self> {
        let pool = hcat_common::db::open_in_memory().await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> hcat_common::Result<Self> {
        init_tables(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn record_count(&self) -> Result<i64, CatalogError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM catalog_records")
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    pub async fn asset_count(&self) -> Result<i64, CatalogError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM catalog_assets")
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    /// Asset ids linked to a record
    pub async fn assets_of(&self, record_id: Uuid) -> Result<Vec<Uuid>, CatalogError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM catalog_assets WHERE record_id = ? ORDER BY id")
                .bind(record_id.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;
        ids.iter().map(|s| parse_uuid(s)).collect()
    }

    /// Close the pool; every later call fails with `Unavailable`
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn init_tables(pool: &SqlitePool) -> hcat_common::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS catalog_records (
            id TEXT PRIMARY KEY,
            parent_id TEXT REFERENCES catalog_records(id),
            reference TEXT UNIQUE,
            fields TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS catalog_assets (
            id TEXT PRIMARY KEY,
            record_id TEXT NOT NULL REFERENCES catalog_records(id),
            path TEXT NOT NULL,
            checksum TEXT NOT NULL,
            byte_size INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_catalog_records_parent ON catalog_records(parent_id)")
        .execute(pool)
        .await?;

    Ok(())
}

fn map_err(err: sqlx::Error) -> CatalogError {
    match err {
        sqlx::Error::RowNotFound => CatalogError::NotFound("row not found".to_string()),
        sqlx::Error::Database(db_err) => {
            if db_err.is_unique_violation() {
                CatalogError::AlreadyExists(db_err.message().to_string())
            } else if db_err.is_foreign_key_violation() || db_err.is_check_violation() {
                CatalogError::ConstraintViolation(db_err.message().to_string())
            } else {
                CatalogError::Unavailable(db_err.message().to_string())
            }
        }
        other => CatalogError::Unavailable(other.to_string()),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, CatalogError> {
    Uuid::parse_str(s).map_err(|e| CatalogError::ConstraintViolation(format!("bad id {}: {}", s, e)))
}

fn encode_fields(fields: &BTreeMap<String, String>) -> Result<String, CatalogError> {
    serde_json::to_string(fields).map_err(|e| CatalogError::ConstraintViolation(e.to_string()))
}

#[async_trait]
impl CatalogStore for SqliteCatalog {
    async fn create_record(&self, record: &NewRecord) -> Result<(), CatalogError> {
        let fields = encode_fields(&record.fields)?;
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO catalog_records (id, parent_id, reference, fields, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.parent_id.map(|id| id.to_string()))
        .bind(record.reference.as_deref())
        .bind(&fields)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(())
    }

    async fn fetch_record(&self, id: Uuid) -> Result<CatalogRecord, CatalogError> {
        let row = sqlx::query("SELECT id, parent_id, reference, fields FROM catalog_records WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;

        let parent_id: Option<String> = row.get("parent_id");
        let fields: String = row.get("fields");

        Ok(CatalogRecord {
            id,
            parent_id: parent_id.as_deref().map(parse_uuid).transpose()?,
            reference: row.get("reference"),
            fields: serde_json::from_str(&fields)
                .map_err(|e| CatalogError::ConstraintViolation(e.to_string()))?,
        })
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Uuid>, CatalogError> {
        let id: Option<String> =
            sqlx::query_scalar("SELECT id FROM catalog_records WHERE reference = ?")
                .bind(reference)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_err)?;

        id.as_deref().map(parse_uuid).transpose()
    }

    async fn update_record(
        &self,
        id: Uuid,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), CatalogError> {
        let encoded = encode_fields(fields)?;

        let result = sqlx::query("UPDATE catalog_records SET fields = ?, updated_at = ? WHERE id = ?")
            .bind(&encoded)
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_err)?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn link_asset(
        &self,
        record_id: Uuid,
        asset_id: Uuid,
        asset: &StoredAsset,
    ) -> Result<(), CatalogError> {
        sqlx::query(
            r#"
            INSERT INTO catalog_assets (id, record_id, path, checksum, byte_size, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(asset_id.to_string())
        .bind(record_id.to_string())
        .bind(&asset.path)
        .bind(&asset.checksum)
        .bind(asset.byte_size as i64)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(())
    }

    async fn unlink_asset(&self, asset_id: Uuid) -> Result<(), CatalogError> {
        let result = sqlx::query("DELETE FROM catalog_assets WHERE id = ?")
            .bind(asset_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_err)?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(asset_id.to_string()));
        }
        Ok(())
    }

    async fn delete_record(&self, id: Uuid) -> Result<(), CatalogError> {
        let result = sqlx::query("DELETE FROM catalog_records WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_err)?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
