//! Test Helper Utilities
//!
//! Shared fixtures for hcat-ingest integration tests: an in-memory pipeline
//! wired to an in-memory catalog, a filesystem asset store under a temp
//! directory, and catalog wrappers that inject failures.

#![allow(dead_code)]

use async_trait::async_trait;
use hcat_common::events::EventBus;
use hcat_ingest::capabilities::{
    Capabilities, CatalogError, CatalogRecord, CatalogStore, Enrichment, EnrichmentError,
    FsAssetStore, NewRecord, SqliteCatalog, StoredAsset,
};
use hcat_ingest::config::IngestSettings;
use hcat_ingest::models::{IngestJob, IngestSession, JobStatus, SessionConfig};
use hcat_ingest::services::StartOutcome;
use hcat_ingest::{db, Pipeline};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

pub const CSV_HEADER: &str = "legacyId,parentId,identifier,title,levelOfDescription";

/// Build a CSV payload from the standard header and `rows`
pub fn csv(rows: &[&str]) -> Vec<u8> {
    let mut text = String::from(CSV_HEADER);
    for row in rows {
        text.push('\n');
        text.push_str(row);
    }
    text.push('\n');
    text.into_bytes()
}

/// `n` flat rows R1..Rn, all valid
pub fn flat_csv(n: usize) -> Vec<u8> {
    let rows: Vec<String> = (1..=n)
        .map(|i| format!("R{i},,REF-{i},Record {i},File"))
        .collect();
    let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
    csv(&rows)
}

pub fn config(title: &str) -> SessionConfig {
    SessionConfig {
        title: title.to_string(),
        ..Default::default()
    }
}

pub fn test_settings() -> IngestSettings {
    IngestSettings {
        max_lock_wait_ms: 500,
        ..Default::default()
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Pipeline over in-memory databases; keep the struct alive for the test
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub db: SqlitePool,
    pub catalog: Arc<SqliteCatalog>,
    pub asset_dir: PathBuf,
    pub manifest_dir: PathBuf,
    pub event_bus: EventBus,
    pub pipeline: Pipeline,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::build(test_settings(), |catalog, _| catalog as Arc<dyn CatalogStore>, None).await
    }

    pub async fn with_settings(settings: IngestSettings) -> Self {
        Self::build(settings, |catalog, _| catalog as Arc<dyn CatalogStore>, None).await
    }

    /// Environment whose catalog fails on demand
    pub async fn failing() -> (Self, Arc<FailingCatalog>) {
        let mut slot = None;
        let env = Self::build(
            test_settings(),
            |catalog, _| {
                let failing = Arc::new(FailingCatalog::new(catalog));
                slot = Some(failing.clone());
                failing as Arc<dyn CatalogStore>
            },
            None,
        )
        .await;
        (env, slot.unwrap())
    }

    /// Environment that requests job cancellation once `trigger` is created
    pub async fn cancelling(trigger: &str) -> Self {
        Self::build(
            test_settings(),
            |catalog, db| Arc::new(CancellingCatalog::new(catalog, db, trigger)) as Arc<dyn CatalogStore>,
            None,
        )
        .await
    }

    pub async fn with_enrichment(enrichment: Arc<dyn Enrichment>) -> Self {
        Self::build(
            test_settings(),
            |catalog, _| catalog as Arc<dyn CatalogStore>,
            Some(enrichment),
        )
        .await
    }

    /// `wrap` receives the reference catalog and the pipeline pool and
    /// returns the store the pipeline should use
    pub async fn build<F>(
        settings: IngestSettings,
        wrap: F,
        enrichment: Option<Arc<dyn Enrichment>>,
    ) -> Self
    where
        F: FnOnce(Arc<SqliteCatalog>, SqlitePool) -> Arc<dyn CatalogStore>,
    {
        let temp_dir = TempDir::new().unwrap();
        let asset_dir = temp_dir.path().join("assets");
        let manifest_dir = temp_dir.path().join("manifests");

        let db = db::init_in_memory().await.unwrap();
        let catalog = Arc::new(SqliteCatalog::in_memory().await.unwrap());
        let store = wrap(catalog.clone(), db.clone());

        let mut caps = Capabilities::with_defaults(store, Arc::new(FsAssetStore::new(asset_dir.clone())));
        if let Some(enrichment) = enrichment {
            caps = caps.with_enrichment(enrichment);
        }

        let event_bus = EventBus::new(settings.event_capacity);
        let pipeline = Pipeline::new(
            db.clone(),
            caps,
            settings,
            event_bus.clone(),
            manifest_dir.clone(),
        );

        Self {
            temp_dir,
            db,
            catalog,
            asset_dir,
            manifest_dir,
            event_bus,
            pipeline,
        }
    }

    /// Create, upload, auto-map and validate a session
    pub async fn validated_session(&self, config: SessionConfig, payload: &[u8]) -> IngestSession {
        let sessions = &self.pipeline.sessions;
        let session = sessions.create(config).await.unwrap();
        sessions
            .upload(session.id, "batch.csv", None, payload)
            .await
            .unwrap();
        sessions.auto_map(session.id).await.unwrap();
        sessions.validate(session.id, false).await.unwrap();
        sessions.get(session.id).await.unwrap()
    }

    /// Session approved for commit
    pub async fn previewed_session(&self, config: SessionConfig, payload: &[u8]) -> IngestSession {
        let session = self.validated_session(config, payload).await;
        self.pipeline.sessions.preview(session.id).await.unwrap();
        self.pipeline.sessions.get(session.id).await.unwrap()
    }

    /// Queue and run a job for an approved session
    pub async fn commit(&self, session_id: Uuid) -> IngestJob {
        let job = self.pipeline.sessions.create_job(session_id).await.unwrap();
        match self.pipeline.runner.run(job.id).await.unwrap() {
            StartOutcome::Finished(job) => job,
            StartOutcome::AlreadyRunning => panic!("job {} unexpectedly already running", job.id),
        }
    }

    /// Catalog record by source reference
    pub async fn record_by_reference(&self, reference: &str) -> Option<CatalogRecord> {
        let id = self.catalog.find_by_reference(reference).await.unwrap()?;
        Some(self.catalog.fetch_record(id).await.unwrap())
    }
}

// ============================================================================
// Failure injection
// ============================================================================

/// Catalog wrapper failing chosen operations
pub struct FailingCatalog {
    inner: Arc<SqliteCatalog>,
    /// Source reference → error returned by `create_record`
    fail_create: Mutex<HashMap<String, CatalogError>>,
    /// Record ids whose deletion fails
    fail_delete: Mutex<HashSet<Uuid>>,
}

impl FailingCatalog {
    pub fn new(inner: Arc<SqliteCatalog>) -> Self {
        Self {
            inner,
            fail_create: Mutex::new(HashMap::new()),
            fail_delete: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_create(&self, reference: &str, error: CatalogError) {
        self.fail_create
            .lock()
            .unwrap()
            .insert(reference.to_string(), error);
    }

    pub fn fail_delete(&self, record_id: Uuid) {
        self.fail_delete.lock().unwrap().insert(record_id);
    }

    pub fn clear(&self) {
        self.fail_create.lock().unwrap().clear();
        self.fail_delete.lock().unwrap().clear();
    }
}

#[async_trait]
impl CatalogStore for FailingCatalog {
    async fn create_record(&self, record: &NewRecord) -> Result<(), CatalogError> {
        let injected = record
            .reference
            .as_ref()
            .and_then(|r| self.fail_create.lock().unwrap().get(r).cloned());
        match injected {
            Some(error) => Err(error),
            None => self.inner.create_record(record).await,
        }
    }

    async fn fetch_record(&self, id: Uuid) -> Result<CatalogRecord, CatalogError> {
        self.inner.fetch_record(id).await
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Uuid>, CatalogError> {
        self.inner.find_by_reference(reference).await
    }

    async fn update_record(
        &self,
        id: Uuid,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), CatalogError> {
        self.inner.update_record(id, fields).await
    }

    async fn link_asset(
        &self,
        record_id: Uuid,
        asset_id: Uuid,
        asset: &StoredAsset,
    ) -> Result<(), CatalogError> {
        self.inner.link_asset(record_id, asset_id, asset).await
    }

    async fn unlink_asset(&self, asset_id: Uuid) -> Result<(), CatalogError> {
        self.inner.unlink_asset(asset_id).await
    }

    async fn delete_record(&self, id: Uuid) -> Result<(), CatalogError> {
        if self.fail_delete.lock().unwrap().contains(&id) {
            return Err(CatalogError::Unavailable("injected delete failure".to_string()));
        }
        self.inner.delete_record(id).await
    }
}

/// Catalog wrapper that requests cancellation of every running job right
/// after the record with `trigger` is created
pub struct CancellingCatalog {
    inner: Arc<SqliteCatalog>,
    pipeline_db: SqlitePool,
    trigger: String,
}

impl CancellingCatalog {
    pub fn new(inner: Arc<SqliteCatalog>, pipeline_db: SqlitePool, trigger: &str) -> Self {
        Self {
            inner,
            pipeline_db,
            trigger: trigger.to_string(),
        }
    }
}

#[async_trait]
impl CatalogStore for CancellingCatalog {
    async fn create_record(&self, record: &NewRecord) -> Result<(), CatalogError> {
        self.inner.create_record(record).await?;
        if record.reference.as_deref() == Some(self.trigger.as_str()) {
            let running = db::jobs::jobs_in_status(&self.pipeline_db, JobStatus::Running)
                .await
                .unwrap();
            for job in running {
                db::jobs::request_cancel(&self.pipeline_db, job.id)
                    .await
                    .unwrap();
            }
        }
        Ok(())
    }

    async fn fetch_record(&self, id: Uuid) -> Result<CatalogRecord, CatalogError> {
        self.inner.fetch_record(id).await
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Uuid>, CatalogError> {
        self.inner.find_by_reference(reference).await
    }

    async fn update_record(
        &self,
        id: Uuid,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), CatalogError> {
        self.inner.update_record(id, fields).await
    }

    async fn link_asset(
        &self,
        record_id: Uuid,
        asset_id: Uuid,
        asset: &StoredAsset,
    ) -> Result<(), CatalogError> {
        self.inner.link_asset(record_id, asset_id, asset).await
    }

    async fn unlink_asset(&self, asset_id: Uuid) -> Result<(), CatalogError> {
        self.inner.unlink_asset(asset_id).await
    }

    async fn delete_record(&self, id: Uuid) -> Result<(), CatalogError> {
        self.inner.delete_record(id).await
    }
}

/// Enrichment that always fails, counting its calls
#[derive(Default)]
pub struct FailingEnrichment {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Enrichment for FailingEnrichment {
    async fn enrich(
        &self,
        _record_id: Uuid,
        _fields: &BTreeMap<String, String>,
    ) -> Result<(), EnrichmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EnrichmentError("enrichment service offline".to_string()))
    }
}
