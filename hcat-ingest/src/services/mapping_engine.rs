//! Source column → target field auto-mapping
//!
//! **Algorithm:**
//! 1. Normalize header and candidate names (lowercase ASCII alphanumerics)
//! 2. Score each target field: exact canonical or synonym match = 1.0,
//!    otherwise normalized Levenshtein similarity (synonyms weighted 0.95)
//! 3. Best field at or above threshold is assigned, unless a different field
//!    scores within the ambiguity margin (exact matches always win)
//! 4. When several columns claim one field, the highest score keeps it
//!    (earlier column on ties); the others become ambiguous
//! 5. Manual overrides replace the auto result for their column and take the
//!    field away from any auto-mapped column
//!
//! Output depends only on the header list, the schema and the two settings.
//! Scores are rounded to 4 decimals so they persist and compare exactly.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::models::schema::normalize_name;
use crate::models::{
    FieldMapping, MappedRow, MappingCandidate, MappingOverride, MappingStatus, SourceRow,
    TargetSchema,
};

const SYNONYM_WEIGHT: f64 = 0.95;
const MAX_CANDIDATES: usize = 3;

/// Fields defaulted after mapping when empty (field, value)
const POST_MAPPING_DEFAULTS: &[(&str, &str)] = &[("culture", "en"), ("publicationStatus", "Draft")];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MappingEngine {
    threshold: f64,
    margin: f64,
}

impl MappingEngine {
    pub fn new(threshold: f64, margin: f64) -> Self {
        Self { threshold, margin }
    }

    /// Score one header against every field, best first (schema order on ties)
    pub fn score_column(&self, header: &str, schema: &TargetSchema) -> Vec<MappingCandidate> {
        let norm = normalize_name(header);
        let mut scored: Vec<MappingCandidate> = schema
            .fields
            .iter()
            .map(|field| MappingCandidate {
                field_id: field.id.clone(),
                score: round4(field_score(&norm, &field.id, &field.synonyms)),
            })
            .collect();

        // Stable sort keeps schema order among equal scores
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored
    }

    /// Compute auto mappings for a header list
    pub fn auto_map(
        &self,
        session_id: Uuid,
        headers: &[String],
        schema: &TargetSchema,
    ) -> Vec<FieldMapping> {
        let mut mappings: Vec<FieldMapping> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.is_empty())
            .map(|(position, header)| self.map_column(session_id, position, header, schema))
            .collect();

        resolve_claims(&mut mappings);
        mappings
    }

    fn map_column(
        &self,
        session_id: Uuid,
        position: usize,
        header: &str,
        schema: &TargetSchema,
    ) -> FieldMapping {
        let scored = self.score_column(header, schema);
        let best = scored.first().map(|c| c.score).unwrap_or(0.0);
        let runner_up = scored.get(1).map(|c| c.score).unwrap_or(0.0);

        let status = if best < self.threshold {
            MappingStatus::Unmapped
        } else if best >= 1.0 && runner_up < 1.0 {
            MappingStatus::Auto
        } else if best - runner_up < self.margin {
            MappingStatus::Ambiguous
        } else {
            MappingStatus::Auto
        };

        let target_field = match status {
            MappingStatus::Auto => scored.first().map(|c| c.field_id.clone()),
            _ => None,
        };

        FieldMapping {
            session_id,
            source_column: header.to_string(),
            position,
            target_field,
            confidence: best,
            transform: None,
            default_value: None,
            manual_override: false,
            status,
            candidates: scored.into_iter().take(MAX_CANDIDATES).collect(),
        }
    }

    /// Re-apply remembered manual mappings over a fresh auto result
    pub fn merge_manual(&self, mappings: &mut Vec<FieldMapping>, previous: &[FieldMapping]) {
        for manual in previous.iter().filter(|m| m.manual_override) {
            if let Some(slot) = mappings
                .iter_mut()
                .find(|m| m.source_column == manual.source_column)
            {
                let candidates = std::mem::take(&mut slot.candidates);
                *slot = FieldMapping {
                    position: slot.position,
                    candidates,
                    ..manual.clone()
                };
            }
        }
        release_manual_claims(mappings);
    }

    /// Apply operator overrides in place
    ///
    /// Unknown columns or target fields are rejected before anything changes.
    pub fn apply_overrides(
        &self,
        mappings: &mut Vec<FieldMapping>,
        overrides: &[MappingOverride],
        schema: &TargetSchema,
    ) -> Result<()> {
        for ov in overrides {
            if !mappings.iter().any(|m| m.source_column == ov.source_column) {
                return Err(IngestError::InvalidInput(format!(
                    "unknown source column '{}'",
                    ov.source_column
                )));
            }
            if let Some(field) = &ov.target_field {
                if !schema.has_field(field) {
                    return Err(IngestError::InvalidInput(format!(
                        "unknown target field '{}' for standard {}",
                        field, schema.standard
                    )));
                }
            }
        }

        let mut seen = HashMap::new();
        for ov in overrides {
            if let Some(field) = &ov.target_field {
                if let Some(other) = seen.insert(field.clone(), ov.source_column.clone()) {
                    return Err(IngestError::InvalidInput(format!(
                        "columns '{}' and '{}' both target '{}'",
                        other, ov.source_column, field
                    )));
                }
            }
        }

        // Earlier manual mappings keep their field unless overridden here too
        for m in mappings.iter().filter(|m| m.status == MappingStatus::Manual) {
            let overridden = overrides.iter().any(|ov| ov.source_column == m.source_column);
            if let Some(field) = m.target_field.as_ref().filter(|_| !overridden) {
                if let Some(column) = seen.get(field) {
                    return Err(IngestError::InvalidInput(format!(
                        "'{}' is already mapped manually from column '{}' (requested for '{}')",
                        field, m.source_column, column
                    )));
                }
            }
        }

        for ov in overrides {
            if let Some(slot) = mappings
                .iter_mut()
                .find(|m| m.source_column == ov.source_column)
            {
                slot.target_field = ov.target_field.clone();
                slot.transform = ov.transform;
                slot.default_value = ov.default_value.clone().filter(|v| !v.is_empty());
                slot.manual_override = true;
                slot.confidence = 1.0;
                slot.status = if ov.target_field.is_some() {
                    MappingStatus::Manual
                } else {
                    MappingStatus::Ignored
                };
            }
        }

        release_manual_claims(mappings);
        Ok(())
    }
}

/// Columns still needing resolution, in column order
pub fn unresolved_columns(mappings: &[FieldMapping]) -> Vec<String> {
    let mut columns: Vec<&FieldMapping> = mappings
        .iter()
        .filter(|m| m.status.is_unresolved())
        .collect();
    columns.sort_by_key(|m| m.position);
    columns.into_iter().map(|m| m.source_column.clone()).collect()
}

/// Project a source row onto target fields
///
/// Applies transforms and per-mapping defaults, then the row's operator
/// fixes, then the post-mapping defaults. Empty results are dropped. Each field takes its value from one
/// column: manual mappings claim first, then auto mappings, then accepted
/// ambiguous columns; the earlier column wins within a tier.
pub fn map_row(
    row: &SourceRow,
    mappings: &[FieldMapping],
    schema: &TargetSchema,
    accept_unresolved: bool,
) -> MappedRow {
    let mut ordered: Vec<&FieldMapping> = mappings.iter().collect();
    ordered.sort_by_key(|m| (claim_tier(m.status), m.position));

    let mut claimed = HashSet::new();
    let mut fields = std::collections::BTreeMap::new();
    for mapping in ordered {
        let Some(target) = mapping.effective_target(accept_unresolved) else {
            continue;
        };
        if !claimed.insert(target) {
            continue;
        }

        let raw = row
            .values
            .get(&mapping.source_column)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .or(mapping.default_value.as_deref());

        if let Some(raw) = raw {
            let value = match mapping.transform {
                Some(transform) => transform.apply(raw),
                None => raw.to_string(),
            };
            if !value.trim().is_empty() {
                fields.insert(target.to_string(), value);
            }
        }
    }

    for (field, value) in &row.fixes {
        match value.trim() {
            "" => fields.remove(field),
            fixed => fields.insert(field.clone(), fixed.to_string()),
        };
    }

    for (field, value) in POST_MAPPING_DEFAULTS {
        if schema.has_field(field) && !fields.contains_key(*field) {
            fields.insert(field.to_string(), value.to_string());
        }
    }

    MappedRow {
        index: row.index,
        fields,
    }
}

/// Map every row the operator has not excluded
pub fn map_rows(
    rows: &[SourceRow],
    mappings: &[FieldMapping],
    schema: &TargetSchema,
    accept_unresolved: bool,
) -> Vec<MappedRow> {
    rows.iter()
        .filter(|row| !row.excluded)
        .map(|row| map_row(row, mappings, schema, accept_unresolved))
        .collect()
}

fn claim_tier(status: MappingStatus) -> u8 {
    match status {
        MappingStatus::Manual => 0,
        MappingStatus::Auto => 1,
        _ => 2,
    }
}

fn field_score(header: &str, id: &str, synonyms: &[String]) -> f64 {
    if header.is_empty() {
        return 0.0;
    }
    let canonical = similarity(header, &normalize_name(id));
    synonyms
        .iter()
        .map(|syn| {
            let norm = normalize_name(syn);
            if norm == header {
                1.0
            } else {
                similarity(header, &norm) * SYNONYM_WEIGHT
            }
        })
        .fold(canonical, f64::max)
}

fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        1.0
    } else {
        strsim::normalized_levenshtein(a, b)
    }
}

fn round4(score: f64) -> f64 {
    (score * 10_000.0).round() / 10_000.0
}

/// One column per field among auto mappings: best score wins, then position
fn resolve_claims(mappings: &mut [FieldMapping]) {
    let mut winners: HashMap<String, (f64, usize)> = HashMap::new();
    for m in mappings.iter().filter(|m| m.status == MappingStatus::Auto) {
        if let Some(field) = &m.target_field {
            let entry = winners.entry(field.clone()).or_insert((m.confidence, m.position));
            if m.confidence > entry.0 || (m.confidence == entry.0 && m.position < entry.1) {
                *entry = (m.confidence, m.position);
            }
        }
    }

    for m in mappings.iter_mut().filter(|m| m.status == MappingStatus::Auto) {
        let keeps = m
            .target_field
            .as_ref()
            .and_then(|f| winners.get(f))
            .map(|(_, position)| *position == m.position)
            .unwrap_or(false);
        if !keeps {
            m.status = MappingStatus::Ambiguous;
            m.target_field = None;
        }
    }
}

/// Auto mappings lose fields claimed by a manual mapping
///
/// The field is also dropped from their candidates, so accepting the
/// unresolved column later cannot hand it back.
fn release_manual_claims(mappings: &mut [FieldMapping]) {
    let manual_fields: HashSet<String> = mappings
        .iter()
        .filter(|m| m.status == MappingStatus::Manual)
        .filter_map(|m| m.target_field.clone())
        .collect();

    for m in mappings.iter_mut().filter(|m| !m.manual_override) {
        if m
            .target_field
            .as_ref()
            .is_some_and(|field| manual_fields.contains(field))
        {
            m.status = MappingStatus::Ambiguous;
            m.target_field = None;
        }
        m.candidates.retain(|c| !manual_fields.contains(&c.field_id));
    }
}
