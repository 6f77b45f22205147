//! Session state machine
//!
//! Every operation loads the session by id, checks its prerequisites against
//! the persisted state, and writes its artifact together with the state
//! change in one transaction. The state change is a compare-and-set on the
//! state observed at load time, so two racing operations cannot both apply.
//!
//! | Operation      | From                              | To          | Artifact            |
//! |----------------|-----------------------------------|-------------|---------------------|
//! | `upload`       | Configuring, Uploaded             | Uploaded    | source rows         |
//! | `auto_map`     | Uploaded … Previewed              | Mapped      | mapping set         |
//! | `set_mapping`  | Mapped … Previewed                | Mapped      | mapping set         |
//! | `apply_mapping_profile` | Mapped … Previewed       | Mapped      | mapping set         |
//! | `exclude_row`, `fix_row` | Uploaded … Previewed    | Uploaded or Mapped | row edits    |
//! | `validate`     | Mapped … Previewed                | Validated   | finding set         |
//! | `preview`      | Validated                         | Previewed   | (none, derived)     |
//! | `create_job`   | Previewed, Failed, RolledBack     | Committing  | queued job          |
//! | `cancel`       | any before Committing             | Cancelled   |                     |

use chrono::{Duration, Utc};
use hcat_common::events::{EventBus, IngestEvent};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::capabilities::{Capabilities, ReaderRegistry};
use crate::config::IngestSettings;
use crate::db;
use crate::error::{IngestError, Result};
use crate::models::{
    FieldMapping, IngestJob, IngestSession, JobStatus, MappingOverride, MappingProfile,
    SessionConfig, SessionState, Severity, SourceDescriptor, SourceRow, TargetSchema,
    ValidationFinding,
};
use crate::services::mapping_engine::{self, MappingEngine};
use crate::services::preview_builder::{self, PreviewTree};
use crate::services::validator::Validator;

pub struct SessionManager {
    db: SqlitePool,
    caps: Capabilities,
    settings: IngestSettings,
    event_bus: EventBus,
    engine: MappingEngine,
}

impl SessionManager {
    pub fn new(
        db: SqlitePool,
        caps: Capabilities,
        settings: IngestSettings,
        event_bus: EventBus,
    ) -> Self {
        let engine = MappingEngine::new(settings.confidence_threshold, settings.ambiguity_margin);
        Self {
            db,
            caps,
            settings,
            event_bus,
            engine,
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub async fn create(&self, config: SessionConfig) -> Result<IngestSession> {
        if config.title.trim().is_empty() {
            return Err(IngestError::InvalidInput("session title is required".to_string()));
        }
        schema_for(&config)?;

        let session = IngestSession::new(config);
        db::sessions::insert_session(&self.db, &session).await?;

        info!(
            session_id = %session.id,
            standard = %session.config.standard,
            "Ingest session created"
        );
        Ok(session)
    }

    pub async fn get(&self, session_id: Uuid) -> Result<IngestSession> {
        db::sessions::load_session(&self.db, session_id)
            .await?
            .ok_or_else(|| IngestError::session_not_found(session_id))
    }

    pub async fn list(&self) -> Result<Vec<IngestSession>> {
        db::sessions::list_sessions(&self.db).await
    }

    pub async fn mappings(&self, session_id: Uuid) -> Result<Vec<FieldMapping>> {
        self.get(session_id).await?;
        db::mappings::load_mappings(&self.db, session_id).await
    }

    pub async fn findings(
        &self,
        session_id: Uuid,
        severity: Option<Severity>,
    ) -> Result<Vec<ValidationFinding>> {
        self.get(session_id).await?;
        db::findings::load_findings(&self.db, session_id, severity).await
    }

    pub async fn jobs(&self, session_id: Uuid) -> Result<Vec<IngestJob>> {
        self.get(session_id).await?;
        db::jobs::jobs_for_session(&self.db, session_id).await
    }

    // ========================================================================
    // Workflow steps
    // ========================================================================

    /// Parse and store a source payload
    ///
    /// `format` defaults to the file name's extension. Re-uploading replaces
    /// the rows and discards mappings and findings derived from the old ones.
    pub async fn upload(
        &self,
        session_id: Uuid,
        file_name: &str,
        format: Option<&str>,
        payload: &[u8],
    ) -> Result<IngestSession> {
        let session = self.get(session_id).await?;
        self.require(&session, SessionState::Uploaded, "upload a source")?;

        let format = match format {
            Some(f) => f.to_string(),
            None => ReaderRegistry::format_of(file_name).ok_or_else(|| {
                IngestError::InvalidInput(format!("cannot infer format of '{}'", file_name))
            })?,
        };
        let reader = self.caps.readers.for_format(&format)?;
        let batch = reader.parse(payload)?;

        let source = SourceDescriptor {
            name: file_name.to_string(),
            format,
            byte_size: payload.len() as u64,
        };

        let mut tx = self.db.begin().await?;
        db::rows::replace_rows(&mut tx, session_id, &batch.rows).await?;
        db::mappings::replace_mappings(&mut tx, session_id, &[]).await?;
        db::findings::clear_findings(&mut tx, session_id).await?;
        db::sessions::update_source(&mut tx, session_id, &source, &batch.headers, batch.rows.len())
            .await?;
        db::sessions::transition(&mut tx, session_id, session.state, SessionState::Uploaded).await?;
        tx.commit().await?;

        info!(
            session_id = %session_id,
            file = %source.name,
            rows = batch.rows.len(),
            columns = batch.headers.len(),
            "Source uploaded"
        );
        self.emit_transition(session_id, session.state, SessionState::Uploaded);
        self.get(session_id).await
    }

    /// Compute auto mappings; remembered manual overrides are re-applied
    pub async fn auto_map(&self, session_id: Uuid) -> Result<Vec<FieldMapping>> {
        let session = self.get(session_id).await?;
        self.require(&session, SessionState::Mapped, "map columns")?;
        let schema = schema_for(&session.config)?;

        let previous = db::mappings::load_mappings(&self.db, session_id).await?;
        let mut mappings = self.engine.auto_map(session_id, &session.headers, &schema);
        self.engine.merge_manual(&mut mappings, &previous);

        self.store_mappings(&session, &mappings).await?;

        let unresolved = mapping_engine::unresolved_columns(&mappings);
        info!(
            session_id = %session_id,
            columns = mappings.len(),
            unresolved = unresolved.len(),
            "Columns auto-mapped"
        );
        Ok(mappings)
    }

    /// Apply operator overrides; they win over auto-detection from now on
    pub async fn set_mapping(
        &self,
        session_id: Uuid,
        overrides: &[MappingOverride],
    ) -> Result<Vec<FieldMapping>> {
        let session = self.get(session_id).await?;
        if session.state == SessionState::Uploaded {
            return Err(IngestError::Precondition(
                "run auto-mapping before overriding mappings".to_string(),
            ));
        }
        self.require(&session, SessionState::Mapped, "override mappings")?;
        let schema = schema_for(&session.config)?;

        let mut mappings = db::mappings::load_mappings(&self.db, session_id).await?;
        self.engine.apply_overrides(&mut mappings, overrides, &schema)?;

        self.store_mappings(&session, &mappings).await?;

        info!(
            session_id = %session_id,
            overrides = overrides.len(),
            "Manual mappings applied"
        );
        Ok(mappings)
    }

    // ========================================================================
    // Mapping profiles
    // ========================================================================

    /// Save the session's current mappings under a name
    ///
    /// An existing profile of the same name is replaced.
    pub async fn save_mapping_profile(&self, session_id: Uuid, name: &str) -> Result<MappingProfile> {
        if name.trim().is_empty() {
            return Err(IngestError::InvalidInput("profile name is required".to_string()));
        }
        let session = self.get(session_id).await?;
        let mappings = db::mappings::load_mappings(&self.db, session_id).await?;
        let profile = MappingProfile::from_mappings(name, &session.config.standard, &mappings);
        if profile.entries.is_empty() {
            return Err(IngestError::Precondition(
                "session has no mapped columns to save".to_string(),
            ));
        }

        let profile = db::profiles::save_profile(&self.db, &profile).await?;
        info!(
            session_id = %session_id,
            profile = %profile.name,
            entries = profile.entries.len(),
            "Mapping profile saved"
        );
        Ok(profile)
    }

    pub async fn list_mapping_profiles(&self) -> Result<Vec<MappingProfile>> {
        db::profiles::list_profiles(&self.db).await
    }

    /// Apply a saved profile as manual overrides
    ///
    /// Profile entries match source columns case-insensitively. Entries
    /// naming fields the session's schema lacks are skipped.
    pub async fn apply_mapping_profile(
        &self,
        session_id: Uuid,
        profile_id: Uuid,
    ) -> Result<Vec<FieldMapping>> {
        let profile = db::profiles::load_profile(&self.db, profile_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("mapping profile {}", profile_id)))?;
        let session = self.get(session_id).await?;
        let schema = schema_for(&session.config)?;
        let mappings = db::mappings::load_mappings(&self.db, session_id).await?;

        let overrides: Vec<MappingOverride> = mappings
            .iter()
            .filter_map(|m| {
                let entry = profile.entry_for(&m.source_column)?;
                let field = entry.target_field.as_deref()?;
                if !schema.has_field(field) {
                    debug!(profile = %profile.name, field, "Profile field not in schema, skipped");
                    return None;
                }
                Some(MappingOverride {
                    source_column: m.source_column.clone(),
                    ..entry.clone()
                })
            })
            .collect();
        if overrides.is_empty() {
            return Err(IngestError::InvalidInput(format!(
                "profile '{}' matches no column of this session",
                profile.name
            )));
        }

        let mappings = self.set_mapping(session_id, &overrides).await?;
        info!(
            session_id = %session_id,
            profile = %profile.name,
            applied = overrides.len(),
            "Mapping profile applied"
        );
        Ok(mappings)
    }

    // ========================================================================
    // Row edits
    // ========================================================================

    /// Leave a row out of (or put it back into) the batch
    pub async fn exclude_row(
        &self,
        session_id: Uuid,
        row_index: usize,
        excluded: bool,
    ) -> Result<SourceRow> {
        self.edit_row(session_id, row_index, |row| row.excluded = excluded)
            .await
    }

    /// Set a target field of one row directly, bypassing its mapped value
    ///
    /// An empty value clears the field for that row.
    pub async fn fix_row(
        &self,
        session_id: Uuid,
        row_index: usize,
        field: &str,
        value: &str,
    ) -> Result<SourceRow> {
        let session = self.get(session_id).await?;
        let schema = schema_for(&session.config)?;
        if !schema.has_field(field) {
            return Err(IngestError::InvalidInput(format!(
                "unknown target field '{}' for standard {}",
                field, schema.standard
            )));
        }
        self.edit_row(session_id, row_index, |row| {
            row.fixes.insert(field.to_string(), value.trim().to_string());
        })
        .await
    }

    /// Change one row and invalidate findings derived from the old values
    ///
    /// A session that was mapped or further returns to Mapped; an Uploaded
    /// session stays Uploaded.
    async fn edit_row<F>(&self, session_id: Uuid, row_index: usize, edit: F) -> Result<SourceRow>
    where
        F: FnOnce(&mut SourceRow),
    {
        let session = self.get(session_id).await?;
        let to = match session.state {
            SessionState::Uploaded => SessionState::Uploaded,
            SessionState::Mapped | SessionState::Validated | SessionState::Previewed => {
                SessionState::Mapped
            }
            other => {
                return Err(IngestError::Precondition(format!(
                    "cannot edit rows while session is {}",
                    other
                )))
            }
        };
        let mut row = db::rows::load_row(&self.db, session_id, row_index)
            .await?
            .ok_or_else(|| {
                IngestError::NotFound(format!("row {} of session {}", row_index, session_id))
            })?;
        edit(&mut row);

        let mut tx = self.db.begin().await?;
        db::rows::update_edits(&mut tx, session_id, &row).await?;
        db::findings::clear_findings(&mut tx, session_id).await?;
        db::sessions::transition(&mut tx, session_id, session.state, to).await?;
        tx.commit().await?;

        info!(
            session_id = %session_id,
            row = row_index,
            excluded = row.excluded,
            fixes = row.fixes.len(),
            "Row edited"
        );
        if session.state != to {
            self.emit_transition(session_id, session.state, to);
        }
        Ok(row)
    }

    async fn store_mappings(&self, session: &IngestSession, mappings: &[FieldMapping]) -> Result<()> {
        let mut tx = self.db.begin().await?;
        db::mappings::replace_mappings(&mut tx, session.id, mappings).await?;
        db::findings::clear_findings(&mut tx, session.id).await?;
        db::sessions::set_accept_unresolved(&mut tx, session.id, false).await?;
        db::sessions::transition(&mut tx, session.id, session.state, SessionState::Mapped).await?;
        tx.commit().await?;

        self.emit_transition(session.id, session.state, SessionState::Mapped);
        Ok(())
    }

    /// Regenerate the session's finding set
    ///
    /// Field, cross-field and rule-set findings come from the validator;
    /// orphan, cycle and depth findings from the hierarchy analysis. Both are
    /// stored together, ordered by row.
    pub async fn validate(
        &self,
        session_id: Uuid,
        accept_unresolved: bool,
    ) -> Result<Vec<ValidationFinding>> {
        let session = self.get(session_id).await?;
        self.require(&session, SessionState::Validated, "validate")?;
        let schema = schema_for(&session.config)?;

        let mappings = db::mappings::load_mappings(&self.db, session_id).await?;
        if mappings.is_empty() {
            return Err(IngestError::Precondition(
                "session has no column mappings".to_string(),
            ));
        }
        let unresolved = mapping_engine::unresolved_columns(&mappings);
        if !unresolved.is_empty() && !accept_unresolved {
            return Err(IngestError::MappingAmbiguity {
                columns: unresolved,
            });
        }

        let rows = db::rows::load_rows(&self.db, session_id).await?;
        let mapped = mapping_engine::map_rows(&rows, &mappings, &schema, accept_unresolved);

        let rule_sets = self
            .caps
            .rule_sets
            .select(&session.config.sector, &session.config.standard);
        let validator = Validator::new(
            &schema,
            self.caps.vocabulary.as_ref(),
            rule_sets,
            session.config.asset_root.as_deref(),
        );
        let mut findings = validator.validate(session_id, &mapped);

        let plan = preview_builder::analyze(
            session_id,
            &mapped,
            &session.config.hierarchy,
            &schema.key_field,
            self.caps.catalog.as_ref(),
            self.settings.max_hierarchy_depth,
        )
        .await?;
        findings.extend(plan.findings);
        findings.sort_by_key(|f| f.row_index);

        let mut tx = self.db.begin().await?;
        db::findings::replace_findings(&mut tx, session_id, &findings).await?;
        db::sessions::set_accept_unresolved(&mut tx, session_id, accept_unresolved).await?;
        db::sessions::transition(&mut tx, session_id, session.state, SessionState::Validated)
            .await?;
        tx.commit().await?;

        let errors = findings.iter().filter(|f| f.is_error()).count();
        info!(
            session_id = %session_id,
            errors,
            warnings = findings.len() - errors,
            "Validation finished"
        );
        self.emit_transition(session_id, session.state, SessionState::Validated);
        Ok(findings)
    }

    /// Build the hierarchy preview
    ///
    /// The first preview after validation approves the session for commit
    /// (Validated → Previewed). Later calls are read-only.
    pub async fn preview(&self, session_id: Uuid) -> Result<PreviewTree> {
        let session = self.get(session_id).await?;
        let approves = match session.state {
            SessionState::Validated => true,
            SessionState::Previewed
            | SessionState::Committing
            | SessionState::Completed
            | SessionState::Failed
            | SessionState::RolledBack => false,
            other => {
                return Err(IngestError::Precondition(format!(
                    "cannot preview a session in state {}",
                    other
                )))
            }
        };
        let schema = schema_for(&session.config)?;

        let rows = db::rows::load_rows(&self.db, session_id).await?;
        let mappings = db::mappings::load_mappings(&self.db, session_id).await?;
        let mapped = mapping_engine::map_rows(&rows, &mappings, &schema, session.accept_unresolved);
        let findings = db::findings::load_findings(&self.db, session_id, None).await?;

        let plan = preview_builder::analyze(
            session_id,
            &mapped,
            &session.config.hierarchy,
            &schema.key_field,
            self.caps.catalog.as_ref(),
            self.settings.max_hierarchy_depth,
        )
        .await?;
        let tree = preview_builder::build_tree(
            &mapped,
            &plan,
            &findings,
            self.settings.preview_child_cap,
            self.settings.max_hierarchy_depth,
        );

        if approves {
            let mut conn = self.db.acquire().await?;
            db::sessions::transition(&mut conn, session_id, session.state, SessionState::Previewed)
                .await?;
            drop(conn);
            info!(
                session_id = %session_id,
                eligible = tree.eligible_rows,
                total = tree.total_rows,
                "Preview approved"
            );
            self.emit_transition(session_id, session.state, SessionState::Previewed);
        } else {
            debug!(session_id = %session_id, state = %session.state, "Preview rebuilt");
        }
        Ok(tree)
    }

    /// Queue a commit job for the session
    ///
    /// A session takes a new job only from Previewed, or again from
    /// Failed/RolledBack once every earlier job is failed or rolled back.
    pub async fn create_job(&self, session_id: Uuid) -> Result<IngestJob> {
        let session = self.get(session_id).await?;
        self.require(&session, SessionState::Committing, "start a commit")?;

        let previous = db::jobs::jobs_for_session(&self.db, session_id).await?;
        if let Some(blocking) = previous
            .iter()
            .find(|j| !matches!(j.status, JobStatus::Failed | JobStatus::RolledBack))
        {
            return Err(IngestError::Precondition(format!(
                "job {} is {}; roll it back before committing again",
                blocking.id, blocking.status
            )));
        }

        let included = db::rows::load_rows(&self.db, session_id)
            .await?
            .iter()
            .filter(|r| !r.excluded)
            .count();
        let job = IngestJob::new(session_id, included);

        let mut tx = self.db.begin().await?;
        db::jobs::insert_job(&mut *tx, &job).await?;
        db::sessions::transition(&mut tx, session_id, session.state, SessionState::Committing)
            .await?;
        tx.commit().await?;

        info!(
            session_id = %session_id,
            job_id = %job.id,
            total_rows = job.total_rows,
            "Commit job queued"
        );
        self.emit_transition(session_id, session.state, SessionState::Committing);
        self.event_bus.emit_lossy(IngestEvent::JobQueued {
            job_id: job.id,
            session_id,
            total_rows: job.total_rows,
            timestamp: Utc::now(),
        });
        Ok(job)
    }

    /// Abandon a session before commit
    pub async fn cancel(&self, session_id: Uuid) -> Result<IngestSession> {
        let session = self.get(session_id).await?;
        self.require(&session, SessionState::Cancelled, "cancel")?;

        let mut conn = self.db.acquire().await?;
        db::sessions::transition(&mut conn, session_id, session.state, SessionState::Cancelled)
            .await?;
        drop(conn);

        info!(session_id = %session_id, from = %session.state, "Session cancelled");
        self.emit_transition(session_id, session.state, SessionState::Cancelled);
        self.get(session_id).await
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Delete a terminal session whose retention window has passed
    pub async fn delete(&self, session_id: Uuid) -> Result<()> {
        let session = self.get(session_id).await?;
        if !session.state.is_terminal() {
            return Err(IngestError::Precondition(format!(
                "session in state {} cannot be deleted",
                session.state
            )));
        }
        if session.updated_at > self.retention_cutoff() {
            return Err(IngestError::Precondition(format!(
                "session is within its {}h retention window",
                self.settings.session_retention_hours
            )));
        }

        db::sessions::delete_session(&self.db, session_id).await?;
        info!(session_id = %session_id, "Session deleted");
        Ok(())
    }

    /// Delete every expired terminal session
    pub async fn cleanup_expired(&self) -> Result<Vec<Uuid>> {
        let expired = db::sessions::expired_sessions(&self.db, self.retention_cutoff()).await?;
        for session_id in &expired {
            db::sessions::delete_session(&self.db, *session_id).await?;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired sessions deleted");
        }
        Ok(expired)
    }

    fn retention_cutoff(&self) -> chrono::DateTime<Utc> {
        Utc::now() - Duration::hours(self.settings.session_retention_hours)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn require(&self, session: &IngestSession, to: SessionState, action: &str) -> Result<()> {
        if session.state == to || session.state.can_transition(to) {
            Ok(())
        } else {
            Err(IngestError::Precondition(format!(
                "cannot {} while session is {}",
                action, session.state
            )))
        }
    }

    fn emit_transition(&self, session_id: Uuid, from: SessionState, to: SessionState) {
        self.event_bus.emit_lossy(IngestEvent::SessionStateChanged {
            session_id,
            old_state: from.as_str().to_string(),
            new_state: to.as_str().to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Target schema of a session's descriptive standard
pub fn schema_for(config: &SessionConfig) -> Result<TargetSchema> {
    TargetSchema::for_standard(&config.standard).ok_or_else(|| {
        IngestError::InvalidInput(format!("unknown descriptive standard '{}'", config.standard))
    })
}
