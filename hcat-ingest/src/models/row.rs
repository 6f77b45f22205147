//! Source and mapped row records

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One normalized source row (column name → cell value)
///
/// `index` is the 1-based position of the row in the uploaded payload,
/// excluding the header line. Operators can leave a row out of the batch
/// (`excluded`) or correct target fields directly (`fixes`, target field →
/// value, an empty value clears the field).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRow {
    pub index: usize,
    pub values: BTreeMap<String, String>,
    #[serde(default)]
    pub excluded: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fixes: BTreeMap<String, String>,
}

impl SourceRow {
    pub fn new(index: usize, values: BTreeMap<String, String>) -> Self {
        Self {
            index,
            values,
            excluded: false,
            fixes: BTreeMap::new(),
        }
    }
}

/// A row after column mapping, transforms and defaults (target field → value)
///
/// Empty values are dropped during mapping, so presence means "non-empty".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedRow {
    pub index: usize,
    pub fields: BTreeMap<String, String>,
}

impl MappedRow {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Pipe-delimited multi-value field, trimmed, empties removed
    pub fn get_list(&self, field: &str) -> Vec<&str> {
        self.get(field)
            .map(|v| {
                v.split('|')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}
