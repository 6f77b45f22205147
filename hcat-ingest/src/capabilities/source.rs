//! CSV/TSV source reader and format registry

use csv::ReaderBuilder;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{SourceBatch, SourceError, SourceReader};
use crate::models::SourceRow;

/// Delimited-text reader
///
/// The first record is the header line. Headers are trimmed; a UTF-8 BOM on
/// the first header is dropped. Rows where every cell is empty are skipped
/// but still consume a row index, so indexes match the operator's spreadsheet.
pub struct CsvReader {
    delimiter: u8,
    formats: &'static [&'static str],
}

impl CsvReader {
    pub fn csv() -> Self {
        Self {
            delimiter: b',',
            formats: &["csv"],
        }
    }

    pub fn tsv() -> Self {
        Self {
            delimiter: b'\t',
            formats: &["tsv", "tab"],
        }
    }
}

impl SourceReader for CsvReader {
    fn formats(&self) -> &[&'static str] {
        self.formats
    }

    fn parse(&self, payload: &[u8]) -> Result<SourceBatch, SourceError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| SourceError::CorruptPayload(format!("payload is not UTF-8: {}", e)))?;

        let mut rdr = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = rdr
            .headers()
            .map_err(|e| SourceError::CorruptPayload(e.to_string()))?
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let h = if i == 0 { h.trim_start_matches('\u{feff}') } else { h };
                h.trim().to_string()
            })
            .collect();

        if headers.iter().all(|h| h.is_empty()) {
            return Err(SourceError::CorruptPayload("missing header line".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for header in headers.iter().filter(|h| !h.is_empty()) {
            if !seen.insert(header.as_str()) {
                return Err(SourceError::CorruptPayload(format!(
                    "duplicate column header '{}'",
                    header
                )));
            }
        }

        let mut rows = Vec::new();
        for (i, record) in rdr.records().enumerate() {
            let record = record.map_err(|e| SourceError::CorruptPayload(e.to_string()))?;
            let values: BTreeMap<String, String> = headers
                .iter()
                .zip(record.iter())
                .filter(|(h, _)| !h.is_empty())
                .map(|(h, v)| (h.clone(), v.trim().to_string()))
                .collect();

            if values.values().all(|v| v.is_empty()) {
                continue;
            }
            rows.push(SourceRow::new(i + 1, values));
        }

        Ok(SourceBatch { headers, rows })
    }
}

/// Format → reader lookup
pub struct ReaderRegistry {
    readers: Vec<Arc<dyn SourceReader>>,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self {
            readers: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CsvReader::csv()));
        registry.register(Arc::new(CsvReader::tsv()));
        registry
    }

    pub fn register(&mut self, reader: Arc<dyn SourceReader>) {
        self.readers.push(reader);
    }

    pub fn for_format(&self, format: &str) -> Result<Arc<dyn SourceReader>, SourceError> {
        let format = format.trim().to_ascii_lowercase();
        self.readers
            .iter()
            .find(|r| r.formats().contains(&format.as_str()))
            .cloned()
            .ok_or(SourceError::UnsupportedFormat(format))
    }

    /// Format from a file name's extension
    pub fn format_of(file_name: &str) -> Option<String> {
        std::path::Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

impl Default for ReaderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
