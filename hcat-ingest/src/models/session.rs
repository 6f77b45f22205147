//! Ingest session state machine
//!
//! Sessions progress through:
//! CONFIGURING → UPLOADED → MAPPED → VALIDATED → PREVIEWED → COMMITTING → {COMPLETED | FAILED}
//!
//! CANCELLED is reachable from any state before COMMITTING; ROLLED_BACK only
//! from COMPLETED. Re-commit re-enters COMMITTING from FAILED or ROLLED_BACK.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Ingest session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Created, no source uploaded yet
    Configuring,
    /// Source rows stored
    Uploaded,
    /// Column mappings computed
    Mapped,
    /// Findings computed
    Validated,
    /// Hierarchy preview approved for commit
    Previewed,
    /// A commit job is queued or running
    Committing,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Configuring => "CONFIGURING",
            SessionState::Uploaded => "UPLOADED",
            SessionState::Mapped => "MAPPED",
            SessionState::Validated => "VALIDATED",
            SessionState::Previewed => "PREVIEWED",
            SessionState::Committing => "COMMITTING",
            SessionState::Completed => "COMPLETED",
            SessionState::Failed => "FAILED",
            SessionState::Cancelled => "CANCELLED",
            SessionState::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn parse(s: &str) -> Option<SessionState> {
        let state = match s {
            "CONFIGURING" => SessionState::Configuring,
            "UPLOADED" => SessionState::Uploaded,
            "MAPPED" => SessionState::Mapped,
            "VALIDATED" => SessionState::Validated,
            "PREVIEWED" => SessionState::Previewed,
            "COMMITTING" => SessionState::Committing,
            "COMPLETED" => SessionState::Completed,
            "FAILED" => SessionState::Failed,
            "CANCELLED" => SessionState::Cancelled,
            "ROLLED_BACK" => SessionState::RolledBack,
            _ => return None,
        };
        Some(state)
    }

    /// States from which the operator may still cancel the session
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            SessionState::Configuring
                | SessionState::Uploaded
                | SessionState::Mapped
                | SessionState::Validated
                | SessionState::Previewed
        )
    }

    /// No further pipeline steps apply (cleanup candidates)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Failed
                | SessionState::Cancelled
                | SessionState::RolledBack
        )
    }

    /// Transition table
    ///
    /// Re-running an earlier step (re-upload, re-map, re-validate) moves the
    /// session back to that step's state; later artifacts are regenerated.
    pub fn can_transition(&self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (from, Cancelled) => from.is_cancellable(),
            (Configuring | Uploaded, Uploaded) => true,
            (Uploaded | Mapped | Validated | Previewed, Mapped) => true,
            (Mapped | Validated | Previewed, Validated) => true,
            (Validated | Previewed, Previewed) => true,
            (Previewed | Failed | RolledBack, Committing) => true,
            (Committing, Completed | Failed) => true,
            (Completed, RolledBack) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the preview builder derives parent links
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HierarchyMode {
    /// Each row names its parent's key (`parent_field` → `key_field`)
    ParentReference {
        key_field: String,
        parent_field: String,
    },
    /// A path string such as `Fonds A/Series 1/File 3`; parent is the prefix
    Path { path_field: String, separator: String },
    /// Level column; a row's parent is the nearest preceding row with a
    /// strictly higher level
    Level { level_field: String },
    /// No hierarchy; every row is a root
    Flat,
}

impl Default for HierarchyMode {
    fn default() -> Self {
        HierarchyMode::ParentReference {
            key_field: "legacyId".to_string(),
            parent_field: "parentId".to_string(),
        }
    }
}

/// Operator-supplied session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub title: String,
    /// archive, museum, library, gallery, dam
    #[serde(default = "default_sector")]
    pub sector: String,
    /// Descriptive standard (see `models::schema::KNOWN_STANDARDS`)
    #[serde(default = "default_standard")]
    pub standard: String,
    #[serde(default)]
    pub hierarchy: HierarchyMode,
    /// Existing catalog record under which top-level rows are placed
    #[serde(default)]
    pub parent_record_id: Option<Uuid>,
    /// Directory against which relative asset references resolve
    #[serde(default)]
    pub asset_root: Option<PathBuf>,
    /// Invoke the enrichment capability after each committed record
    #[serde(default)]
    pub enrich: bool,
    /// Update catalog records whose key already exists instead of failing
    #[serde(default)]
    pub update_existing: bool,
}

fn default_sector() -> String {
    "archive".to_string()
}

fn default_standard() -> String {
    "isadg".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            title: String::new(),
            sector: default_sector(),
            standard: default_standard(),
            hierarchy: HierarchyMode::default(),
            parent_record_id: None,
            asset_root: None,
            enrich: false,
            update_existing: false,
        }
    }
}

/// Uploaded payload descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    pub format: String,
    pub byte_size: u64,
}

/// Ingest session (persisted in `ingest_sessions`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSession {
    pub id: Uuid,
    pub state: SessionState,
    pub config: SessionConfig,
    pub source: Option<SourceDescriptor>,
    /// Source header list in column order
    pub headers: Vec<String>,
    pub total_rows: usize,
    /// Operator accepted unresolved mapping ambiguities at validation
    pub accept_unresolved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestSession {
    pub fn new(config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Configuring,
            config,
            source: None,
            headers: Vec::new(),
            total_rows: 0,
            accept_unresolved: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// State transition record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub session_id: Uuid,
    pub old_state: SessionState,
    pub new_state: SessionState,
    pub transitioned_at: DateTime<Utc>,
}
