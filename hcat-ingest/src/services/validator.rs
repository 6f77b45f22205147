//! Row validation
//!
//! Three tiers run in order for every row, accumulating findings:
//! 1. Per-field: required-ness, vocabulary membership, date/number coercion,
//!    asset resolvability (a reference escaping the asset root is an error, a
//!    missing file only a warning since commit skips it)
//! 2. Cross-field: date ranges must not end before they start
//! 3. Rule sets selected for the session's sector/standard
//!
//! Batch-level duplicate detection (keys, and asset files by checksum) runs
//! alongside tier 1. Output order is
//! a function of the input alone (rows in order, schema field order within a
//! row), so re-validation of unchanged input yields an identical finding list.

use chrono::{Datelike, NaiveDate};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::capabilities::asset_fs::file_sha256_hex;
use crate::capabilities::{RuleSet, VocabularyLookup};
use crate::models::finding::{
    ASSET_NOT_FOUND, ASSET_PATH_REJECTED, DATE_RANGE_INVERTED, DUPLICATE_ASSET,
    DUPLICATE_REFERENCE, INVALID_DATE, INVALID_NUMBER, REQUIRED_MISSING, VOCABULARY_UNKNOWN,
};
use crate::models::{FieldKind, MappedRow, TargetSchema, ValidationFinding};

/// Full-date formats accepted by the date coercion
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%d.%m.%Y",
    "%d %B %Y",
    "%B %d, %Y",
    "%d %b %Y",
];

/// A parsed date, widened to a range for partial dates (`1921`, `1921-03`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateValue {
    pub earliest: NaiveDate,
    pub latest: NaiveDate,
}

pub fn parse_date(value: &str) -> Option<DateValue> {
    let value = value.trim();

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(DateValue {
                earliest: date,
                latest: date,
            });
        }
    }

    let digits_only = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());

    if value.len() == 4 && digits_only(value) {
        let year: i32 = value.parse().ok()?;
        return Some(DateValue {
            earliest: NaiveDate::from_ymd_opt(year, 1, 1)?,
            latest: NaiveDate::from_ymd_opt(year, 12, 31)?,
        });
    }

    if let Some((y, m)) = value.split_once('-') {
        if y.len() == 4 && digits_only(y) && (1..=2).contains(&m.len()) && digits_only(m) {
            let year: i32 = y.parse().ok()?;
            let month: u32 = m.parse().ok()?;
            let earliest = NaiveDate::from_ymd_opt(year, month, 1)?;
            let next = if month == 12 {
                NaiveDate::from_ymd_opt(year + 1, 1, 1)?
            } else {
                NaiveDate::from_ymd_opt(earliest.year(), month + 1, 1)?
            };
            return Some(DateValue {
                earliest,
                latest: next.pred_opt()?,
            });
        }
    }

    None
}

/// Resolve an asset reference against the session's asset root
///
/// Returns `None` for references that climb out of the root. With a root
/// set, only plain relative references are accepted, and a reference whose
/// real location (after symlinks) lies outside the root is refused as well.
/// Without a root, references are taken as given, minus `..` components.
pub fn resolve_asset_path(asset_root: Option<&Path>, reference: &str) -> Option<PathBuf> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }
    let path = Path::new(reference);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return None;
    }
    let Some(root) = asset_root else {
        return Some(path.to_path_buf());
    };
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }

    let joined = root.join(path);
    if let (Ok(real), Ok(real_root)) = (joined.canonicalize(), root.canonicalize()) {
        if !real.starts_with(&real_root) {
            return None;
        }
    }
    Some(joined)
}

pub struct Validator<'a> {
    schema: &'a TargetSchema,
    vocabulary: &'a dyn VocabularyLookup,
    rule_sets: Vec<Arc<dyn RuleSet>>,
    asset_root: Option<&'a Path>,
}

impl<'a> Validator<'a> {
    pub fn new(
        schema: &'a TargetSchema,
        vocabulary: &'a dyn VocabularyLookup,
        rule_sets: Vec<Arc<dyn RuleSet>>,
        asset_root: Option<&'a Path>,
    ) -> Self {
        Self {
            schema,
            vocabulary,
            rule_sets,
            asset_root,
        }
    }

    pub fn validate(&self, session_id: Uuid, rows: &[MappedRow]) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();
        let mut seen_keys: HashMap<&str, usize> = HashMap::new();
        let mut seen_assets: HashMap<String, usize> = HashMap::new();

        for row in rows {
            self.check_fields(session_id, row, &mut seen_assets, &mut findings);

            if let Some(key) = row.get(&self.schema.key_field) {
                if let Some(first) = seen_keys.get(key) {
                    findings.push(ValidationFinding::error(
                        session_id,
                        row.index,
                        Some(&self.schema.key_field),
                        DUPLICATE_REFERENCE,
                        format!("'{}' already used by row {}", key, first),
                    ));
                } else {
                    seen_keys.insert(key, row.index);
                }
            }

            self.check_ranges(session_id, row, &mut findings);

            for rule_set in &self.rule_sets {
                for f in rule_set.validate(row, self.schema) {
                    findings.push(ValidationFinding {
                        session_id,
                        row_index: row.index,
                        field_id: f.field_id,
                        severity: f.severity,
                        code: f.code,
                        message: format!("[{}] {}", rule_set.id(), f.message),
                    });
                }
            }
        }

        findings
    }

    fn check_fields(
        &self,
        session_id: Uuid,
        row: &MappedRow,
        seen_assets: &mut HashMap<String, usize>,
        out: &mut Vec<ValidationFinding>,
    ) {
        for field in &self.schema.fields {
            let Some(value) = row.get(&field.id) else {
                if field.required {
                    out.push(ValidationFinding::error(
                        session_id,
                        row.index,
                        Some(&field.id),
                        REQUIRED_MISSING,
                        format!("{} is required", field.label),
                    ));
                }
                continue;
            };

            match &field.kind {
                FieldKind::Vocabulary { taxonomy } => {
                    if !self.vocabulary.is_valid_term(taxonomy, value) {
                        out.push(ValidationFinding::warning(
                            session_id,
                            row.index,
                            Some(&field.id),
                            VOCABULARY_UNKNOWN,
                            format!("'{}' is not a recognised {} term", value, field.label),
                        ));
                    }
                }
                FieldKind::Date => {
                    if parse_date(value).is_none() {
                        out.push(ValidationFinding::error(
                            session_id,
                            row.index,
                            Some(&field.id),
                            INVALID_DATE,
                            format!("'{}' is not a recognised date", value),
                        ));
                    }
                }
                FieldKind::Number => {
                    if value.trim().parse::<f64>().map(|n| !n.is_finite()).unwrap_or(true) {
                        out.push(ValidationFinding::error(
                            session_id,
                            row.index,
                            Some(&field.id),
                            INVALID_NUMBER,
                            format!("'{}' is not a number", value),
                        ));
                    }
                }
                FieldKind::Asset => {
                    for reference in row.get_list(&field.id) {
                        self.check_asset(session_id, row, &field.id, reference, seen_assets, out);
                    }
                }
                FieldKind::Text | FieldKind::Reference => {}
            }
        }
    }

    fn check_asset(
        &self,
        session_id: Uuid,
        row: &MappedRow,
        field_id: &str,
        reference: &str,
        seen_assets: &mut HashMap<String, usize>,
        out: &mut Vec<ValidationFinding>,
    ) {
        let Some(path) = resolve_asset_path(self.asset_root, reference) else {
            out.push(ValidationFinding::error(
                session_id,
                row.index,
                Some(field_id),
                ASSET_PATH_REJECTED,
                format!("asset '{}' is outside the asset root", reference),
            ));
            return;
        };
        if !path.is_file() {
            out.push(ValidationFinding::warning(
                session_id,
                row.index,
                Some(field_id),
                ASSET_NOT_FOUND,
                format!("asset '{}' not found; it will be skipped", reference),
            ));
            return;
        }
        // Unreadable files surface at commit as asset import failures
        let Ok(checksum) = file_sha256_hex(&path) else {
            return;
        };
        match seen_assets.get(&checksum) {
            Some(first) => out.push(ValidationFinding::warning(
                session_id,
                row.index,
                Some(field_id),
                DUPLICATE_ASSET,
                format!("asset '{}' is the same file as row {}", reference, first),
            )),
            None => {
                seen_assets.insert(checksum, row.index);
            }
        }
    }

    fn check_ranges(&self, session_id: Uuid, row: &MappedRow, out: &mut Vec<ValidationFinding>) {
        for range in &self.schema.date_ranges {
            let start = row.get(&range.start).and_then(parse_date);
            let end = row.get(&range.end).and_then(parse_date);
            if let (Some(start), Some(end)) = (start, end) {
                if end.latest < start.earliest {
                    out.push(ValidationFinding::error(
                        session_id,
                        row.index,
                        None,
                        DATE_RANGE_INVERTED,
                        format!("{} precedes {}", range.end, range.start),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{RuleSetRegistry, StaticVocabulary};
    use crate::models::Severity;
    use std::collections::BTreeMap;

    fn row(index: usize, pairs: &[(&str, &str)]) -> MappedRow {
        MappedRow {
            index,
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn base(index: usize, key: &str) -> Vec<(&'static str, String)> {
        vec![
            ("legacyId", key.to_string()),
            ("identifier", format!("ID-{}", index)),
            ("title", format!("Item {}", index)),
            ("levelOfDescription", "Item".to_string()),
        ]
    }

    fn row_from(index: usize, pairs: Vec<(&'static str, String)>) -> MappedRow {
        MappedRow {
            index,
            fields: pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }

    fn run(rows: &[MappedRow]) -> Vec<ValidationFinding> {
        let schema = TargetSchema::for_standard("isadg").unwrap();
        let vocab = StaticVocabulary::default();
        let rules = RuleSetRegistry::with_defaults().select("archive", "isadg");
        Validator::new(&schema, &vocab, rules, None).validate(Uuid::nil(), rows)
    }

    #[test]
    fn test_parse_date_formats() {
        let d = |y, m, day| NaiveDate::from_ymd_opt(y, m, day).unwrap();
        assert_eq!(parse_date("1921-03-12").unwrap().earliest, d(1921, 3, 12));
        assert_eq!(parse_date("12.03.1921").unwrap().earliest, d(1921, 3, 12));
        assert_eq!(parse_date("12 March 1921").unwrap().earliest, d(1921, 3, 12));
        assert_eq!(parse_date("March 12, 1921").unwrap().earliest, d(1921, 3, 12));

        let year = parse_date("1921").unwrap();
        assert_eq!((year.earliest, year.latest), (d(1921, 1, 1), d(1921, 12, 31)));

        let month = parse_date("1920-02").unwrap();
        assert_eq!((month.earliest, month.latest), (d(1920, 2, 1), d(1920, 2, 29)));

        assert!(parse_date("circa 1920").is_none());
        assert!(parse_date("1921-13").is_none());
    }

    #[test]
    fn test_required_field_missing_is_single_error() {
        let rows = vec![
            row_from(1, base(1, "A")),
            row(2, &[("legacyId", "B"), ("identifier", "ID-2"), ("levelOfDescription", "Item")]),
            row_from(3, base(3, "C")),
        ];

        let findings = run(&rows);
        let errors: Vec<&ValidationFinding> = findings.iter().filter(|f| f.is_error()).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].row_index, 2);
        assert_eq!(errors[0].code, REQUIRED_MISSING);
        assert_eq!(errors[0].field_id.as_deref(), Some("title"));
    }

    #[test]
    fn test_vocabulary_warning_and_type_errors() {
        let mut pairs = base(1, "A");
        pairs[3].1 = "Folder".to_string();
        pairs.push(("creationDatesStart", "sometime".to_string()));
        let findings = run(&[row_from(1, pairs)]);

        let codes: Vec<(&str, Severity)> =
            findings.iter().map(|f| (f.code.as_str(), f.severity)).collect();
        assert!(codes.contains(&(VOCABULARY_UNKNOWN, Severity::Warning)));
        assert!(codes.contains(&(INVALID_DATE, Severity::Error)));
    }

    #[test]
    fn test_inverted_range_and_duplicate_key() {
        let mut first = base(1, "A");
        first.push(("creationDatesStart", "1950".to_string()));
        first.push(("creationDatesEnd", "1949-12-31".to_string()));
        let findings = run(&[row_from(1, first), row_from(2, base(2, "A"))]);

        let inverted = findings.iter().find(|f| f.code == DATE_RANGE_INVERTED).unwrap();
        assert_eq!(inverted.row_index, 1);
        assert!(inverted.field_id.is_none());

        let dup = findings.iter().find(|f| f.code == DUPLICATE_REFERENCE).unwrap();
        assert_eq!(dup.row_index, 2);
    }

    #[test]
    fn test_same_year_range_is_valid() {
        let mut pairs = base(1, "A");
        pairs.push(("creationDatesStart", "1950-06-01".to_string()));
        pairs.push(("creationDatesEnd", "1950".to_string()));
        assert!(run(&[row_from(1, pairs)]).iter().all(|f| f.code != DATE_RANGE_INVERTED));
    }

    #[test]
    fn test_missing_asset_and_escaping_reference() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("scan.tif"), b"img").unwrap();

        let schema = TargetSchema::for_standard("isadg").unwrap();
        let vocab = StaticVocabulary::default();
        let validator = Validator::new(&schema, &vocab, Vec::new(), Some(dir.path()));

        let mut pairs = base(1, "A");
        pairs.push((
            "digitalObjectPath",
            "scan.tif|missing.tif|../scan.tif|/etc/passwd".to_string(),
        ));
        let findings = validator.validate(Uuid::nil(), &[row_from(1, pairs)]);

        let missing: Vec<&ValidationFinding> =
            findings.iter().filter(|f| f.code == ASSET_NOT_FOUND).collect();
        assert_eq!(missing.len(), 1);
        assert!(missing[0].message.contains("missing.tif"));
        assert_eq!(missing[0].severity, Severity::Warning);

        let rejected: Vec<&ValidationFinding> =
            findings.iter().filter(|f| f.code == ASSET_PATH_REJECTED).collect();
        assert_eq!(rejected.len(), 2);
        assert!(rejected.iter().all(|f| f.severity == Severity::Error));
        assert!(rejected[1].message.contains("/etc/passwd"));
    }

    #[test]
    fn test_rooted_references_must_stay_inside_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();

        assert_eq!(resolve_asset_path(Some(root), "/etc/passwd"), None);
        assert_eq!(resolve_asset_path(Some(root), "a/../../b"), None);
        assert_eq!(resolve_asset_path(Some(root), "  "), None);
        assert_eq!(
            resolve_asset_path(Some(root), "./scans/a.tif"),
            Some(root.join("./scans/a.tif"))
        );
        assert_eq!(
            resolve_asset_path(None, "/srv/assets/a.tif"),
            Some(PathBuf::from("/srv/assets/a.tif"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_out_of_root_is_rejected() {
        let outside = tempfile::TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"s").unwrap();
        let root = tempfile::TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();
        std::fs::write(root.path().join("ok.tif"), b"img").unwrap();

        assert_eq!(resolve_asset_path(Some(root.path()), "link/secret.txt"), None);
        assert!(resolve_asset_path(Some(root.path()), "ok.tif").is_some());
    }

    #[test]
    fn test_same_file_twice_warns_duplicate_asset() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.tif"), b"same bytes").unwrap();
        std::fs::write(dir.path().join("copy.tif"), b"same bytes").unwrap();
        std::fs::write(dir.path().join("b.tif"), b"other bytes").unwrap();

        let schema = TargetSchema::for_standard("isadg").unwrap();
        let vocab = StaticVocabulary::default();
        let validator = Validator::new(&schema, &vocab, Vec::new(), Some(dir.path()));

        let with_asset = |index: usize, key: &str, asset: &str| {
            let mut pairs = base(index, key);
            pairs.push(("digitalObjectPath", asset.to_string()));
            row_from(index, pairs)
        };
        let rows = vec![
            with_asset(1, "A", "a.tif"),
            with_asset(2, "B", "b.tif"),
            with_asset(3, "C", "copy.tif"),
        ];
        let findings = validator.validate(Uuid::nil(), &rows);

        let dupes: Vec<&ValidationFinding> =
            findings.iter().filter(|f| f.code == DUPLICATE_ASSET).collect();
        assert_eq!(dupes.len(), 1);
        assert_eq!(dupes[0].row_index, 3);
        assert_eq!(dupes[0].severity, Severity::Warning);
        assert!(dupes[0].message.contains("row 1"));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let rows = vec![
            row_from(1, base(1, "A")),
            row(2, &[("legacyId", "A"), ("levelOfDescription", "Fonds")]),
        ];
        assert_eq!(run(&rows), run(&rows));
    }
}
