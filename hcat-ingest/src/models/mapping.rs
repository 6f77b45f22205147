//! Column → field mappings

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Value transform applied after a column is mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Uppercase,
    Lowercase,
    Trim,
    Titlecase,
    /// Reformat a recognised date as YYYY-MM-DD; unrecognised values pass through
    DateIso,
    StripHtml,
}

impl Transform {
    pub fn apply(&self, value: &str) -> String {
        match self {
            Transform::Uppercase => value.to_uppercase(),
            Transform::Lowercase => value.to_lowercase(),
            Transform::Trim => value.trim().to_string(),
            Transform::Titlecase => titlecase(value),
            Transform::DateIso => crate::services::validator::parse_date(value)
                .map(|d| d.earliest.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| value.to_string()),
            Transform::StripHtml => strip_html(value),
        }
    }
}

fn titlecase(value: &str) -> String {
    value
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_tag = false;
    for c in value.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// How the current target of a column was decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    /// Auto-detected above threshold with a clear winner
    Auto,
    /// Set by an operator
    Manual,
    /// Nothing scored above threshold
    Unmapped,
    /// Two fields scored within the ambiguity margin, or another column
    /// claimed the same field with a higher score
    Ambiguous,
    /// Operator chose to drop the column
    Ignored,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Auto => "auto",
            MappingStatus::Manual => "manual",
            MappingStatus::Unmapped => "unmapped",
            MappingStatus::Ambiguous => "ambiguous",
            MappingStatus::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Option<MappingStatus> {
        match s {
            "auto" => Some(MappingStatus::Auto),
            "manual" => Some(MappingStatus::Manual),
            "unmapped" => Some(MappingStatus::Unmapped),
            "ambiguous" => Some(MappingStatus::Ambiguous),
            "ignored" => Some(MappingStatus::Ignored),
            _ => None,
        }
    }

    /// Needs operator attention before validation (unless accepted)
    pub fn is_unresolved(&self) -> bool {
        matches!(self, MappingStatus::Unmapped | MappingStatus::Ambiguous)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingCandidate {
    pub field_id: String,
    pub score: f64,
}

/// One active mapping per (session, source column)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub session_id: Uuid,
    pub source_column: String,
    /// Column position in the source header list
    pub position: usize,
    pub target_field: Option<String>,
    /// 0.0–1.0; 1.0 for manual overrides
    pub confidence: f64,
    pub transform: Option<Transform>,
    pub default_value: Option<String>,
    pub manual_override: bool,
    pub status: MappingStatus,
    /// Best-scoring fields, highest first (kept for operator resolution)
    pub candidates: Vec<MappingCandidate>,
}

impl FieldMapping {
    /// Field that receives this column's values during row mapping
    ///
    /// With `accept_unresolved`, ambiguous columns fall back to their top
    /// candidate; unmapped columns are always dropped.
    pub fn effective_target(&self, accept_unresolved: bool) -> Option<&str> {
        match self.status {
            MappingStatus::Auto | MappingStatus::Manual => self.target_field.as_deref(),
            MappingStatus::Ambiguous if accept_unresolved => self
                .target_field
                .as_deref()
                .or_else(|| self.candidates.first().map(|c| c.field_id.as_str())),
            _ => None,
        }
    }
}

/// Operator override for one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingOverride {
    pub source_column: String,
    /// `None` ignores the column
    pub target_field: Option<String>,
    #[serde(default)]
    pub transform: Option<Transform>,
    #[serde(default)]
    pub default_value: Option<String>,
}
