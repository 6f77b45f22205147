//! Dependency-ordered commit and manifest-driven rollback
//!
//! **Commit algorithm** (one job, sequential):
//! 1. Map the session's rows, mark rows with error findings ineligible
//! 2. Re-derive the hierarchy plan; walk `plan.order` (parents first)
//! 3. Per row, between rows check cancellation (token or durable flag):
//!    a. ineligible → `validation` row error
//!    b. parent not committed in this job → `dependency_unresolved`
//!    c. append manifest entry (`pending`), then create or update the record
//!    d. store and link each asset, recording it in the entry before linking
//!    e. mark the entry `committed`; fire enrichment without awaiting it
//! 4. A row-scoped failure is logged and skipped; an asset failure undoes
//!    the row's record first. A fatal store error stops the job.
//! 5. Export the manifest, then write the final job row and session state
//!    in one transaction.
//!
//! Since entries are written before the mutation they describe, every
//! catalog change made by a job is covered by its manifest, including the
//! row in flight when a job is cancelled or aborted.

use chrono::Utc;
use hcat_common::events::{EventBus, IngestEvent};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capabilities::{
    AssetStoreError, Capabilities, CatalogError, Enrichment, NewRecord,
};
use crate::config::IngestSettings;
use crate::db;
use crate::error::{IngestError, Result};
use crate::models::{
    CommitStage, IngestJob, IngestSession, JobStatus, ManifestAction, ManifestAsset,
    ManifestDocument, ManifestEntry, ManifestEntryState, MappedRow, RowCommitError,
    SessionState, Severity, TargetSchema,
};
use crate::services::mapping_engine;
use crate::services::preview_builder::{self, ParentLink};
use crate::services::session_manager::schema_for;
use crate::services::validator::resolve_asset_path;
use crate::utils::retry_on_lock;

/// Why a row did not commit
#[derive(Debug)]
enum RowFailure {
    Row(RowCommitError),
    /// Store connectivity loss; abandon the job
    Fatal(String),
}

impl From<IngestError> for RowFailure {
    /// Pipeline database failures mid-row cannot be manifested reliably
    fn from(e: IngestError) -> Self {
        RowFailure::Fatal(e.to_string())
    }
}

fn catalog_failure(stage: CommitStage, e: CatalogError) -> RowFailure {
    if e.is_fatal() {
        RowFailure::Fatal(e.to_string())
    } else {
        RowFailure::Row(RowCommitError::new(stage, e.to_string()))
    }
}

fn asset_failure(e: AssetStoreError) -> RowFailure {
    if e.is_fatal() {
        RowFailure::Fatal(e.to_string())
    } else {
        RowFailure::Row(RowCommitError::new(CommitStage::AssetImport, e.to_string()))
    }
}

/// Result of a committed row
struct CommittedRow {
    record_id: Uuid,
    created: bool,
    assets: usize,
}

/// How the row loop ended
enum LoopEnd {
    Exhausted,
    Cancelled,
    Fatal(String),
}

/// Per-entry rollback failure
#[derive(Debug, Clone, Serialize)]
pub struct RollbackFailure {
    pub seq: i64,
    pub row_index: usize,
    pub record_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub reverted_records: usize,
    /// Entries already reverted before this pass
    pub skipped_entries: usize,
    pub failures: Vec<RollbackFailure>,
}

pub struct CommitExecutor {
    db: SqlitePool,
    caps: Capabilities,
    settings: IngestSettings,
    event_bus: EventBus,
    manifest_dir: PathBuf,
}

impl CommitExecutor {
    pub fn new(
        db: SqlitePool,
        caps: Capabilities,
        settings: IngestSettings,
        event_bus: EventBus,
        manifest_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            caps,
            settings,
            event_bus,
            manifest_dir,
        }
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Commit a job that has already been claimed (`running`)
    ///
    /// Returns the job in its final status. `Err` means the job's final state
    /// could not be written; the caller should mark it failed.
    pub async fn execute(&self, mut job: IngestJob, cancel: CancellationToken) -> Result<IngestJob> {
        let session = db::sessions::load_session(&self.db, job.session_id)
            .await?
            .ok_or_else(|| IngestError::session_not_found(job.session_id))?;
        if session.state != SessionState::Committing {
            return Err(IngestError::Precondition(format!(
                "session {} is {}, expected {}",
                session.id,
                session.state,
                SessionState::Committing
            )));
        }

        info!(
            job_id = %job.id,
            session_id = %session.id,
            total_rows = job.total_rows,
            "Commit started"
        );

        let end = match self.commit_rows(&mut job, &session, &cancel).await {
            Ok(end) => end,
            Err(e) => LoopEnd::Fatal(e.to_string()),
        };

        let session_state = match end {
            LoopEnd::Exhausted => {
                job.status = JobStatus::Completed;
                SessionState::Completed
            }
            LoopEnd::Cancelled => {
                info!(
                    job_id = %job.id,
                    processed = job.processed_rows,
                    total = job.total_rows,
                    "Commit cancelled between rows"
                );
                job.status = JobStatus::Cancelled;
                SessionState::Completed
            }
            LoopEnd::Fatal(message) => {
                error!(job_id = %job.id, error = %message, "Commit aborted");
                job.record_error(None, &RowCommitError::new(CommitStage::Fatal, message));
                job.status = JobStatus::Failed;
                SessionState::Failed
            }
        };

        self.finish(job, session_state).await
    }

    async fn commit_rows(
        &self,
        job: &mut IngestJob,
        session: &IngestSession,
        cancel: &CancellationToken,
    ) -> Result<LoopEnd> {
        let schema = schema_for(&session.config)?;
        let rows = db::rows::load_rows(&self.db, session.id).await?;
        let mappings = db::mappings::load_mappings(&self.db, session.id).await?;
        let mapped =
            mapping_engine::map_rows(&rows, &mappings, &schema, session.accept_unresolved);

        let ineligible: HashSet<usize> =
            db::findings::load_findings(&self.db, session.id, Some(Severity::Error))
                .await?
                .into_iter()
                .map(|f| f.row_index)
                .collect();

        let plan = match preview_builder::analyze(
            session.id,
            &mapped,
            &session.config.hierarchy,
            &schema.key_field,
            self.caps.catalog.as_ref(),
            self.settings.max_hierarchy_depth,
        )
        .await
        {
            Ok(plan) => plan,
            Err(e) => return Ok(LoopEnd::Fatal(e.to_string())),
        };

        // Rows found structurally broken now but not at validation time
        // (catalog changed since) are excluded too.
        let ineligible: HashSet<usize> = ineligible
            .into_iter()
            .chain(plan.findings.iter().filter(|f| f.is_error()).map(|f| f.row_index))
            .collect();

        let mut committed: Vec<Option<Uuid>> = vec![None; mapped.len()];
        let mut seq: i64 = db::manifest::load_manifest(&self.db, job.id)
            .await?
            .last()
            .map(|e| e.seq)
            .unwrap_or(0);

        for &pos in &plan.order {
            if cancel.is_cancelled() || db::jobs::is_cancel_requested(&self.db, job.id).await? {
                return Ok(LoopEnd::Cancelled);
            }

            let row = &mapped[pos];
            let outcome = if ineligible.contains(&row.index) {
                Err(RowFailure::Row(RowCommitError::new(
                    CommitStage::Validation,
                    "row has validation errors",
                )))
            } else {
                match self.parent_of(&plan.links[pos], &committed, &mapped, session) {
                    Ok(parent) => {
                        seq += 1;
                        self.commit_row(job.id, seq, row, parent, &schema, session).await
                    }
                    Err(e) => Err(RowFailure::Row(e)),
                }
            };

            match outcome {
                Ok(done) => {
                    committed[pos] = Some(done.record_id);
                    if done.created {
                        job.created_records += 1;
                    }
                    job.created_assets += done.assets;
                    debug!(
                        job_id = %job.id,
                        row_index = row.index,
                        record_id = %done.record_id,
                        "Row committed"
                    );
                }
                Err(RowFailure::Row(e)) => {
                    warn!(
                        job_id = %job.id,
                        row_index = row.index,
                        stage = e.stage.as_str(),
                        error = %e.message,
                        "Row commit failed"
                    );
                    job.record_error(Some(row.index), &e);
                    self.event_bus.emit_lossy(IngestEvent::RowFailed {
                        job_id: job.id,
                        row_index: row.index,
                        stage: e.stage.as_str().to_string(),
                        message: e.message.clone(),
                        timestamp: Utc::now(),
                    });
                }
                Err(RowFailure::Fatal(message)) => return Ok(LoopEnd::Fatal(message)),
            }

            job.processed_rows += 1;
            let snapshot = job.clone();
            retry_on_lock("job progress", self.settings.max_lock_wait_ms, || {
                db::jobs::update_progress(&self.db, &snapshot)
            })
            .await?;
            self.event_bus.emit_lossy(IngestEvent::JobProgress {
                job_id: job.id,
                processed: job.processed_rows,
                total: job.total_rows,
                created_records: job.created_records,
                created_assets: job.created_assets,
                error_count: job.error_count,
                timestamp: Utc::now(),
            });
        }

        Ok(LoopEnd::Exhausted)
    }

    fn parent_of(
        &self,
        link: &ParentLink,
        committed: &[Option<Uuid>],
        rows: &[MappedRow],
        session: &IngestSession,
    ) -> std::result::Result<Option<Uuid>, RowCommitError> {
        match link {
            ParentLink::Root => Ok(session.config.parent_record_id),
            ParentLink::Catalog(id) => Ok(Some(*id)),
            ParentLink::InBatch(p) => committed[*p].map(Some).ok_or_else(|| {
                RowCommitError::new(
                    CommitStage::DependencyUnresolved,
                    format!("parent row {} was not committed", rows[*p].index),
                )
            }),
            ParentLink::Unresolved(reference) => Err(RowCommitError::new(
                CommitStage::DependencyUnresolved,
                format!("parent '{}' not found", reference),
            )),
            ParentLink::Unranked(level) => Err(RowCommitError::new(
                CommitStage::DependencyUnresolved,
                format!("level '{}' cannot be placed", level),
            )),
        }
    }

    async fn commit_row(
        &self,
        job_id: Uuid,
        seq: i64,
        row: &MappedRow,
        parent_id: Option<Uuid>,
        schema: &TargetSchema,
        session: &IngestSession,
    ) -> std::result::Result<CommittedRow, RowFailure> {
        let catalog = self.caps.catalog.as_ref();
        let reference = row.get(&schema.key_field).map(str::to_string);

        let existing = match (&reference, session.config.update_existing) {
            (Some(r), true) => catalog
                .find_by_reference(r)
                .await
                .map_err(|e| catalog_failure(CommitStage::RecordCreate, e))?,
            _ => None,
        };

        let (record_id, action) = match existing {
            Some(id) => {
                let previous = catalog
                    .fetch_record(id)
                    .await
                    .map_err(|e| catalog_failure(CommitStage::RecordCreate, e))?;
                (id, ManifestAction::Updated { previous: previous.fields })
            }
            None => (Uuid::new_v4(), ManifestAction::Created),
        };

        let mut entry = ManifestEntry {
            job_id,
            seq,
            row_index: row.index,
            record_id,
            parent_record_id: parent_id,
            action,
            assets: Vec::new(),
            state: ManifestEntryState::Pending,
        };
        retry_on_lock("manifest append", self.settings.max_lock_wait_ms, || {
            db::manifest::append_entry(&self.db, &entry)
        })
        .await?;

        let mutation = match &entry.action {
            ManifestAction::Created => {
                catalog
                    .create_record(&NewRecord {
                        id: record_id,
                        parent_id,
                        reference: reference.clone(),
                        fields: row.fields.clone(),
                    })
                    .await
            }
            ManifestAction::Updated { .. } => catalog.update_record(record_id, &row.fields).await,
        };
        if let Err(e) = mutation {
            let failure = catalog_failure(CommitStage::RecordCreate, e);
            if matches!(failure, RowFailure::Row(_)) {
                self.set_entry_state(job_id, seq, ManifestEntryState::Reverted).await?;
            }
            return Err(failure);
        }

        if let Err(failure) = self.import_assets(&mut entry, row, schema, session).await {
            if let RowFailure::Row(_) = failure {
                self.compensate(&entry).await?;
            }
            return Err(failure);
        }

        self.set_entry_state(job_id, seq, ManifestEntryState::Committed).await?;

        if session.config.enrich {
            if let Some(enrichment) = &self.caps.enrichment {
                spawn_enrichment(enrichment.clone(), job_id, record_id, row.fields.clone());
            }
        }

        Ok(CommittedRow {
            record_id,
            created: matches!(entry.action, ManifestAction::Created),
            assets: entry.assets.len(),
        })
    }

    /// Store and link every asset the row references
    ///
    /// References to files that do not exist are skipped; validation has
    /// already warned about them.
    async fn import_assets(
        &self,
        entry: &mut ManifestEntry,
        row: &MappedRow,
        schema: &TargetSchema,
        session: &IngestSession,
    ) -> std::result::Result<(), RowFailure> {
        for reference in row.get_list(&schema.asset_field) {
            let path = resolve_asset_path(session.config.asset_root.as_deref(), reference)
                .ok_or_else(|| {
                    RowFailure::Row(RowCommitError::new(
                        CommitStage::AssetImport,
                        format!("asset path '{}' is not allowed", reference),
                    ))
                })?;
            let is_file = tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            if !is_file {
                warn!(
                    job_id = %entry.job_id,
                    row = row.index,
                    asset = %reference,
                    "Asset file missing, skipped"
                );
                continue;
            }
            let bytes = tokio::fs::read(&path).await.map_err(|e| {
                RowFailure::Row(RowCommitError::new(
                    CommitStage::AssetImport,
                    format!("cannot read {}: {}", path.display(), e),
                ))
            })?;

            let stored = self
                .caps
                .assets
                .store(&file_name_of(&path), &bytes)
                .await
                .map_err(asset_failure)?;

            let asset_id = Uuid::new_v4();
            entry.assets.push(ManifestAsset {
                asset_id,
                path: stored.path.clone(),
                checksum: stored.checksum.clone(),
            });
            let assets = entry.assets.clone();
            retry_on_lock("manifest assets", self.settings.max_lock_wait_ms, || {
                db::manifest::set_entry_assets(&self.db, entry.job_id, entry.seq, &assets)
            })
            .await?;

            self.caps
                .catalog
                .link_asset(entry.record_id, asset_id, &stored)
                .await
                .map_err(|e| catalog_failure(CommitStage::AssetImport, e))?;
        }
        Ok(())
    }

    /// Undo a row whose asset import failed
    ///
    /// If any step fails the entry stays live so rollback can finish it.
    async fn compensate(&self, entry: &ManifestEntry) -> Result<()> {
        match self.revert_entry(entry).await {
            Ok(()) => {
                self.set_entry_state(entry.job_id, entry.seq, ManifestEntryState::Reverted)
                    .await
            }
            Err(message) => {
                warn!(
                    job_id = %entry.job_id,
                    row_index = entry.row_index,
                    error = %message,
                    "Could not undo partially committed row; left for rollback"
                );
                Ok(())
            }
        }
    }

    async fn set_entry_state(&self, job_id: Uuid, seq: i64, state: ManifestEntryState) -> Result<()> {
        retry_on_lock("manifest state", self.settings.max_lock_wait_ms, || {
            db::manifest::set_entry_state(&self.db, job_id, seq, state)
        })
        .await
    }

    async fn finish(&self, mut job: IngestJob, session_state: SessionState) -> Result<IngestJob> {
        job.completed_at = Some(Utc::now());
        job.manifest_ref = match self.export_manifest(&job).await {
            Ok(path) => Some(path.display().to_string()),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Manifest export failed; manifest remains in database");
                None
            }
        };

        let mut tx = self.db.begin().await?;
        let written = db::jobs::finish_job(&mut *tx, &job, JobStatus::Running).await?;
        if !written {
            return Err(IngestError::Precondition(format!(
                "job {} is no longer running",
                job.id
            )));
        }
        db::sessions::transition(&mut tx, job.session_id, SessionState::Committing, session_state)
            .await?;
        tx.commit().await?;

        info!(
            job_id = %job.id,
            session_id = %job.session_id,
            outcome = job.outcome(),
            created_records = job.created_records,
            created_assets = job.created_assets,
            error_count = job.error_count,
            "Commit finished"
        );
        self.event_bus.emit_lossy(IngestEvent::SessionStateChanged {
            session_id: job.session_id,
            old_state: SessionState::Committing.as_str().to_string(),
            new_state: session_state.as_str().to_string(),
            timestamp: Utc::now(),
        });
        self.event_bus.emit_lossy(IngestEvent::JobFinished {
            job_id: job.id,
            session_id: job.session_id,
            status: job.status.as_str().to_string(),
            created_records: job.created_records,
            created_assets: job.created_assets,
            error_count: job.error_count,
            timestamp: Utc::now(),
        });
        Ok(job)
    }

    /// Mark a job failed after an error outside the row loop
    ///
    /// Moves a `Committing` session to `Failed` so it can be committed again.
    pub async fn fail_job(&self, job_id: Uuid, message: &str) -> Result<()> {
        let Some(mut job) = db::jobs::load_job(&self.db, job_id).await? else {
            return Err(IngestError::job_not_found(job_id));
        };
        let from = job.status;
        if from.is_finished() {
            return Ok(());
        }

        job.record_error(None, &RowCommitError::new(CommitStage::Fatal, message));
        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());

        let mut tx = self.db.begin().await?;
        if db::jobs::finish_job(&mut *tx, &job, from).await? {
            let session = db::sessions::load_session(&mut *tx, job.session_id).await?;
            if matches!(session.map(|s| s.state), Some(SessionState::Committing)) {
                db::sessions::transition(
                    &mut tx,
                    job.session_id,
                    SessionState::Committing,
                    SessionState::Failed,
                )
                .await?;
            }
        }
        tx.commit().await?;

        error!(job_id = %job_id, error = %message, "Job marked failed");
        self.event_bus.emit_lossy(IngestEvent::JobFinished {
            job_id,
            session_id: job.session_id,
            status: JobStatus::Failed.as_str().to_string(),
            created_records: job.created_records,
            created_assets: job.created_assets,
            error_count: job.error_count,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    // ========================================================================
    // Manifest
    // ========================================================================

    /// Write the manifest document to `manifest_<session>_<job>.json`
    pub async fn export_manifest(&self, job: &IngestJob) -> Result<PathBuf> {
        let document = ManifestDocument {
            job_id: job.id,
            session_id: job.session_id,
            status: job.outcome().to_string(),
            exported_at: Utc::now(),
            entries: db::manifest::load_manifest(&self.db, job.id).await?,
        };

        tokio::fs::create_dir_all(&self.manifest_dir).await?;
        let path = self
            .manifest_dir
            .join(format!("manifest_{}_{}.json", job.session_id, job.id));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&document)?).await?;

        debug!(job_id = %job.id, path = %path.display(), "Manifest exported");
        Ok(path)
    }

    // ========================================================================
    // Rollback
    // ========================================================================

    /// Revert every live manifest entry of a job, newest first
    ///
    /// Entries that fail are reported and left live; the rest are reverted
    /// regardless. The job becomes `rolled_back` only when nothing failed,
    /// so a partial rollback may be retried.
    pub async fn rollback(&self, job_id: Uuid) -> Result<RollbackReport> {
        let job = db::jobs::load_job(&self.db, job_id)
            .await?
            .ok_or_else(|| IngestError::job_not_found(job_id))?;
        if !job.status.is_rollbackable() {
            return Err(IngestError::Precondition(format!(
                "job {} is {} and cannot be rolled back",
                job_id, job.status
            )));
        }

        let entries = db::manifest::load_manifest(&self.db, job_id).await?;
        let skipped_entries = entries.iter().filter(|e| !e.state.is_live()).count();

        info!(
            job_id = %job_id,
            entries = entries.len() - skipped_entries,
            "Rollback started"
        );

        let mut reverted_records = 0;
        let mut failures = Vec::new();
        for entry in entries.iter().rev().filter(|e| e.state.is_live()) {
            match self.revert_entry(entry).await {
                Ok(()) => {
                    self.set_entry_state(job_id, entry.seq, ManifestEntryState::Reverted)
                        .await?;
                    reverted_records += 1;
                }
                Err(message) => {
                    warn!(
                        job_id = %job_id,
                        row_index = entry.row_index,
                        record_id = %entry.record_id,
                        error = %message,
                        "Manifest entry could not be reverted"
                    );
                    failures.push(RollbackFailure {
                        seq: entry.seq,
                        row_index: entry.row_index,
                        record_id: entry.record_id,
                        message,
                    });
                }
            }
        }

        let mut status = job.status;
        if failures.is_empty() {
            let mut tx = self.db.begin().await?;
            if db::jobs::set_status(&mut *tx, job_id, job.status, JobStatus::RolledBack).await? {
                status = JobStatus::RolledBack;
            }
            let session = db::sessions::load_session(&mut *tx, job.session_id).await?;
            if let Some(session) = session.filter(|s| s.state == SessionState::Completed) {
                db::sessions::transition(
                    &mut tx,
                    session.id,
                    SessionState::Completed,
                    SessionState::RolledBack,
                )
                .await?;
                self.event_bus.emit_lossy(IngestEvent::SessionStateChanged {
                    session_id: session.id,
                    old_state: SessionState::Completed.as_str().to_string(),
                    new_state: SessionState::RolledBack.as_str().to_string(),
                    timestamp: Utc::now(),
                });
            }
            tx.commit().await?;
        }

        let refreshed = IngestJob { status, ..job };
        if let Err(e) = self.export_manifest(&refreshed).await {
            warn!(job_id = %job_id, error = %e, "Manifest re-export after rollback failed");
        }

        info!(
            job_id = %job_id,
            reverted = reverted_records,
            failures = failures.len(),
            status = %status,
            "Rollback finished"
        );
        self.event_bus.emit_lossy(IngestEvent::JobRolledBack {
            job_id,
            reverted_records,
            failures: failures.len(),
            timestamp: Utc::now(),
        });

        Ok(RollbackReport {
            job_id,
            status,
            reverted_records,
            skipped_entries,
            failures,
        })
    }

    /// Undo one entry: assets (newest first), then the record itself
    ///
    /// Already-missing assets and records count as reverted.
    async fn revert_entry(&self, entry: &ManifestEntry) -> std::result::Result<(), String> {
        let catalog = self.caps.catalog.as_ref();

        for asset in entry.assets.iter().rev() {
            match catalog.unlink_asset(asset.asset_id).await {
                Ok(()) | Err(CatalogError::NotFound(_)) => {}
                Err(e) => return Err(format!("unlink asset {}: {}", asset.asset_id, e)),
            }
            match self.caps.assets.delete(&asset.path).await {
                Ok(()) | Err(AssetStoreError::NotFound(_)) => {}
                Err(e) => return Err(format!("delete asset {}: {}", asset.path, e)),
            }
        }

        match &entry.action {
            ManifestAction::Created => match catalog.delete_record(entry.record_id).await {
                Ok(()) | Err(CatalogError::NotFound(_)) => Ok(()),
                Err(e) => Err(format!("delete record: {}", e)),
            },
            ManifestAction::Updated { previous } => catalog
                .update_record(entry.record_id, previous)
                .await
                .map_err(|e| format!("restore record: {}", e)),
        }
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "asset".to_string())
}

/// Fire-and-forget enrichment; failures are logged only
fn spawn_enrichment(
    enrichment: std::sync::Arc<dyn Enrichment>,
    job_id: Uuid,
    record_id: Uuid,
    fields: BTreeMap<String, String>,
) {
    tokio::spawn(async move {
        if let Err(e) = enrichment.enrich(record_id, &fields).await {
            warn!(
                job_id = %job_id,
                record_id = %record_id,
                error = %e,
                "Enrichment failed"
            );
        }
    });
}
