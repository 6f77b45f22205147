//! Saved mapping profiles
//!
//! A profile is a named set of column → field mappings taken from one session
//! and replayed onto later sessions whose sources share column names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{FieldMapping, MappingOverride, MappingStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingProfile {
    pub id: Uuid,
    /// Unique; saving under an existing name replaces that profile's entries
    pub name: String,
    /// Standard of the session the profile was saved from
    pub standard: String,
    pub entries: Vec<MappingOverride>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MappingProfile {
    /// Capture the mapped columns of a session (ignored and unresolved
    /// columns are left out)
    pub fn from_mappings(name: &str, standard: &str, mappings: &[FieldMapping]) -> Self {
        let now = Utc::now();
        let entries = mappings
            .iter()
            .filter(|m| matches!(m.status, MappingStatus::Auto | MappingStatus::Manual))
            .filter_map(|m| {
                Some(MappingOverride {
                    source_column: m.source_column.clone(),
                    target_field: Some(m.target_field.clone()?),
                    transform: m.transform,
                    default_value: m.default_value.clone(),
                })
            })
            .collect();
        Self {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            standard: standard.to_string(),
            entries,
            created_at: now,
            updated_at: now,
        }
    }

    /// Entry for a source column, compared case-insensitively
    pub fn entry_for(&self, source_column: &str) -> Option<&MappingOverride> {
        self.entries
            .iter()
            .find(|e| e.source_column.eq_ignore_ascii_case(source_column))
    }
}
