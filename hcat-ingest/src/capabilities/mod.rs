//! External collaborator interfaces
//!
//! The pipeline consumes the catalog, the asset store, vocabularies, rule
//! sets and enrichment only through these traits. Implementations are
//! injected through [`Capabilities`]; the reference ones in the submodules
//! back the binary and the tests.

pub mod asset_fs;
pub mod catalog_sqlite;
pub mod rule_sets;
pub mod source;
pub mod vocabulary;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{MappedRow, Severity, SourceRow, TargetSchema};

pub use asset_fs::FsAssetStore;
pub use catalog_sqlite::SqliteCatalog;
pub use rule_sets::RuleSetRegistry;
pub use source::{CsvReader, ReaderRegistry};
pub use vocabulary::StaticVocabulary;

// ============================================================================
// Source reader
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("Unsupported source format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),
}

/// Parsed payload: header list plus rows in source order
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub headers: Vec<String>,
    pub rows: Vec<SourceRow>,
}

pub trait SourceReader: Send + Sync {
    /// Format identifiers this reader accepts (e.g. `csv`)
    fn formats(&self) -> &[&'static str];

    fn parse(&self, payload: &[u8]) -> Result<SourceBatch, SourceError>;
}

// ============================================================================
// Vocabulary and rule sets
// ============================================================================

pub trait VocabularyLookup: Send + Sync {
    fn is_valid_term(&self, taxonomy: &str, value: &str) -> bool;
}

/// Finding emitted by a rule set (the validator attaches session and row)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFinding {
    pub field_id: Option<String>,
    pub severity: Severity,
    pub code: String,
    pub message: String,
}

/// Standard-compliance rules selected by sector/standard
pub trait RuleSet: Send + Sync {
    fn id(&self) -> &str;

    fn applies_to(&self, sector: &str, standard: &str) -> bool;

    fn validate(&self, row: &MappedRow, schema: &TargetSchema) -> Vec<RuleFinding>;
}

// ============================================================================
// Enrichment
// ============================================================================

#[derive(Debug, Clone, Error)]
#[error("Enrichment failed: {0}")]
pub struct EnrichmentError(pub String);

/// Downstream enrichment; invoked fire-and-forget after a record commits
#[async_trait]
pub trait Enrichment: Send + Sync {
    async fn enrich(
        &self,
        record_id: Uuid,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), EnrichmentError>;
}

// ============================================================================
// Catalog store
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Connectivity loss; aborts the job
    #[error("Catalog unavailable: {0}")]
    Unavailable(String),
}

impl CatalogError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CatalogError::Unavailable(_))
    }
}

/// Record to create; the id is generated by the caller so it can be
/// manifested before the store sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    /// Source key reference (legacy id); unique in the catalog when present
    pub reference: Option<String>,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub reference: Option<String>,
    pub fields: BTreeMap<String, String>,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn create_record(&self, record: &NewRecord) -> Result<(), CatalogError>;

    async fn fetch_record(&self, id: Uuid) -> Result<CatalogRecord, CatalogError>;

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Uuid>, CatalogError>;

    async fn update_record(
        &self,
        id: Uuid,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), CatalogError>;

    async fn link_asset(
        &self,
        record_id: Uuid,
        asset_id: Uuid,
        asset: &StoredAsset,
    ) -> Result<(), CatalogError>;

    async fn unlink_asset(&self, asset_id: Uuid) -> Result<(), CatalogError>;

    async fn delete_record(&self, id: Uuid) -> Result<(), CatalogError>;
}

// ============================================================================
// Asset store
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum AssetStoreError {
    #[error("Asset not found: {0}")]
    NotFound(String),

    #[error("Asset I/O error: {0}")]
    Io(String),

    /// Connectivity loss; aborts the job
    #[error("Asset store unavailable: {0}")]
    Unavailable(String),
}

impl AssetStoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AssetStoreError::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAsset {
    /// Store-relative path
    pub path: String,
    /// SHA-256 hex digest of the content
    pub checksum: String,
    pub byte_size: u64,
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn store(&self, file_name: &str, bytes: &[u8]) -> Result<StoredAsset, AssetStoreError>;

    async fn delete(&self, path: &str) -> Result<(), AssetStoreError>;
}

// ============================================================================
// Bundle
// ============================================================================

/// Collaborators injected into the session manager and commit executor
#[derive(Clone)]
pub struct Capabilities {
    pub readers: Arc<ReaderRegistry>,
    pub vocabulary: Arc<dyn VocabularyLookup>,
    pub rule_sets: Arc<RuleSetRegistry>,
    pub catalog: Arc<dyn CatalogStore>,
    pub assets: Arc<dyn AssetStore>,
    /// Used only for sessions configured with `enrich = true`
    pub enrichment: Option<Arc<dyn Enrichment>>,
}

impl Capabilities {
    /// Reference collaborators around the given catalog and asset store
    pub fn with_defaults(catalog: Arc<dyn CatalogStore>, assets: Arc<dyn AssetStore>) -> Self {
        Self {
            readers: Arc::new(ReaderRegistry::with_defaults()),
            vocabulary: Arc::new(StaticVocabulary::default()),
            rule_sets: Arc::new(RuleSetRegistry::with_defaults()),
            catalog,
            assets,
            enrichment: None,
        }
    }

    pub fn with_enrichment(mut self, enrichment: Arc<dyn Enrichment>) -> Self {
        self.enrichment = Some(enrichment);
        self
    }
}
