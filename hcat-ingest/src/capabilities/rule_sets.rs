//! Built-in standard-compliance rule sets

use std::sync::Arc;

use super::{RuleFinding, RuleSet};
use crate::models::{MappedRow, Severity, TargetSchema};

fn finding(field: &str, severity: Severity, code: &str, message: String) -> RuleFinding {
    RuleFinding {
        field_id: Some(field.to_string()),
        severity,
        code: code.to_string(),
        message,
    }
}

/// ISAD(G): aggregate levels should describe scope and extent
pub struct IsadgRules;

const AGGREGATE_LEVELS: &[&str] = &["fonds", "subfonds", "collection", "series", "record group"];

impl RuleSet for IsadgRules {
    fn id(&self) -> &str {
        "isadg"
    }

    fn applies_to(&self, _sector: &str, standard: &str) -> bool {
        matches!(standard, "isadg" | "rad" | "dacs")
    }

    fn validate(&self, row: &MappedRow, schema: &TargetSchema) -> Vec<RuleFinding> {
        let level = match row.get(&schema.level_field) {
            Some(level) => level.trim().to_lowercase(),
            None => return Vec::new(),
        };
        if !AGGREGATE_LEVELS.contains(&level.as_str()) {
            return Vec::new();
        }

        let mut findings = Vec::new();
        for field in ["scopeAndContent", "extentAndMedium"] {
            if schema.has_field(field) && row.get(field).is_none() {
                findings.push(finding(
                    field,
                    Severity::Warning,
                    "ISADG_AGGREGATE_INCOMPLETE",
                    format!("{} level description should include {}", level, field),
                ));
            }
        }
        findings
    }
}

/// Spectrum: every object needs an object number
pub struct SpectrumRules;

impl RuleSet for SpectrumRules {
    fn id(&self) -> &str {
        "spectrum"
    }

    fn applies_to(&self, sector: &str, standard: &str) -> bool {
        standard == "spectrum" || (sector == "museum" && standard == "cco")
    }

    fn validate(&self, row: &MappedRow, schema: &TargetSchema) -> Vec<RuleFinding> {
        let mut findings = Vec::new();
        if schema.has_field("objectNumber") && row.get("objectNumber").is_none() {
            findings.push(finding(
                "objectNumber",
                Severity::Error,
                "SPECTRUM_OBJECT_NUMBER",
                "object number is mandatory for museum objects".to_string(),
            ));
        }
        if schema.has_field("objectName") && row.get("objectName").is_none() {
            findings.push(finding(
                "objectName",
                Severity::Warning,
                "SPECTRUM_OBJECT_NAME",
                "object name is recommended".to_string(),
            ));
        }
        findings
    }
}

/// Dublin Core: language should be an ISO 639 code
pub struct DublinCoreRules;

impl RuleSet for DublinCoreRules {
    fn id(&self) -> &str {
        "dc"
    }

    fn applies_to(&self, _sector: &str, standard: &str) -> bool {
        standard == "dc"
    }

    fn validate(&self, row: &MappedRow, _schema: &TargetSchema) -> Vec<RuleFinding> {
        match row.get("language") {
            Some(lang)
                if !(2..=3).contains(&lang.len())
                    || !lang.chars().all(|c| c.is_ascii_alphabetic()) =>
            {
                vec![finding(
                    "language",
                    Severity::Warning,
                    "DC_LANGUAGE_CODE",
                    format!("'{}' is not an ISO 639 language code", lang),
                )]
            }
            _ => Vec::new(),
        }
    }
}

/// Rule sets selectable by sector/standard
pub struct RuleSetRegistry {
    rule_sets: Vec<Arc<dyn RuleSet>>,
}

impl RuleSetRegistry {
    pub fn new() -> Self {
        Self {
            rule_sets: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(IsadgRules));
        registry.register(Arc::new(SpectrumRules));
        registry.register(Arc::new(DublinCoreRules));
        registry
    }

    pub fn register(&mut self, rule_set: Arc<dyn RuleSet>) {
        self.rule_sets.push(rule_set);
    }

    /// Rule sets for a session, in registration order
    pub fn select(&self, sector: &str, standard: &str) -> Vec<Arc<dyn RuleSet>> {
        let sector = sector.to_ascii_lowercase();
        let standard = standard.to_ascii_lowercase();
        self.rule_sets
            .iter()
            .filter(|r| r.applies_to(&sector, &standard))
            .cloned()
            .collect()
    }
}

impl Default for RuleSetRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
