//! Commit manifest entries
//!
//! Entries are appended in commit order (`seq`) and consumed in reverse by
//! rollback. An entry is written `Pending` before the catalog mutation it
//! describes, so no mutation can exist without its entry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ManifestAction {
    Created,
    /// Existing record updated; rollback restores `previous`
    Updated { previous: BTreeMap<String, String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestEntryState {
    /// Mutation about to be attempted (may or may not have reached the store)
    Pending,
    Committed,
    /// Undone (rollback or in-row compensation)
    Reverted,
}

impl ManifestEntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestEntryState::Pending => "pending",
            ManifestEntryState::Committed => "committed",
            ManifestEntryState::Reverted => "reverted",
        }
    }

    pub fn parse(s: &str) -> Option<ManifestEntryState> {
        match s {
            "pending" => Some(ManifestEntryState::Pending),
            "committed" => Some(ManifestEntryState::Committed),
            "reverted" => Some(ManifestEntryState::Reverted),
            _ => None,
        }
    }

    /// Needs undoing on rollback
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ManifestEntryState::Pending | ManifestEntryState::Committed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestAsset {
    pub asset_id: Uuid,
    /// Store-relative path
    pub path: String,
    /// SHA-256 hex digest
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub job_id: Uuid,
    /// Commit order within the job (1-based)
    pub seq: i64,
    pub row_index: usize,
    pub record_id: Uuid,
    pub parent_record_id: Option<Uuid>,
    pub action: ManifestAction,
    pub assets: Vec<ManifestAsset>,
    pub state: ManifestEntryState,
}

/// Exported manifest document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub job_id: Uuid,
    pub session_id: Uuid,
    pub status: String,
    pub exported_at: chrono::DateTime<chrono::Utc>,
    pub entries: Vec<ManifestEntry>,
}
