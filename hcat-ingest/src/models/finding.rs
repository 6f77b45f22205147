//! Validation findings (blocking errors and non-blocking warnings)

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Required field empty after mapping and defaults
pub const REQUIRED_MISSING: &str = "REQUIRED_MISSING";
/// Term not in the controlled vocabulary
pub const VOCABULARY_UNKNOWN: &str = "VOCABULARY_UNKNOWN";
pub const INVALID_DATE: &str = "INVALID_DATE";
pub const INVALID_NUMBER: &str = "INVALID_NUMBER";
/// End date precedes start date
pub const DATE_RANGE_INVERTED: &str = "DATE_RANGE_INVERTED";
/// Key reference repeated within the batch
pub const DUPLICATE_REFERENCE: &str = "DUPLICATE_REFERENCE";
/// Asset reference names no readable file (warning; skipped at commit)
pub const ASSET_NOT_FOUND: &str = "ASSET_NOT_FOUND";
/// Asset reference points outside the session's asset root
pub const ASSET_PATH_REJECTED: &str = "ASSET_PATH_REJECTED";
/// Asset file identical to one referenced by an earlier row
pub const DUPLICATE_ASSET: &str = "DUPLICATE_ASSET";
/// Declared parent resolves neither in batch nor in catalog
pub const ORPHAN_PARENT: &str = "ORPHAN_PARENT";
pub const HIERARCHY_CYCLE: &str = "HIERARCHY_CYCLE";
pub const DEPTH_EXCEEDED: &str = "DEPTH_EXCEEDED";
/// Level mode: row's level value ranks nowhere, so it cannot be placed
pub const LEVEL_UNRESOLVED: &str = "LEVEL_UNRESOLVED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }

    pub fn parse(s: &str) -> Option<Severity> {
        match s {
            "error" => Some(Severity::Error),
            "warning" => Some(Severity::Warning),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub session_id: Uuid,
    pub row_index: usize,
    /// `None` for cross-field and structural findings
    pub field_id: Option<String>,
    pub severity: Severity,
    pub code: String,
    pub message: String,
}

impl ValidationFinding {
    pub fn error(
        session_id: Uuid,
        row_index: usize,
        field_id: Option<&str>,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            row_index,
            field_id: field_id.map(str::to_string),
            severity: Severity::Error,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn warning(
        session_id: Uuid,
        row_index: usize,
        field_id: Option<&str>,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(session_id, row_index, field_id, code, message)
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Canonical ordering key: row, then field, then code
    pub fn sort_key(&self) -> (usize, Option<&str>, &str, Severity) {
        (
            self.row_index,
            self.field_id.as_deref(),
            self.code.as_str(),
            self.severity,
        )
    }
}

/// Counts over a finding set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingSummary {
    pub errors: usize,
    pub warnings: usize,
    /// Distinct rows carrying at least one error
    pub ineligible_rows: usize,
}

impl FindingSummary {
    pub fn from_findings(findings: &[ValidationFinding]) -> Self {
        let mut error_rows = std::collections::BTreeSet::new();
        let mut summary = FindingSummary::default();
        for finding in findings {
            match finding.severity {
                Severity::Error => {
                    summary.errors += 1;
                    error_rows.insert(finding.row_index);
                }
                Severity::Warning => summary.warnings += 1,
            }
        }
        summary.ineligible_rows = error_rows.len();
        summary
    }
}
