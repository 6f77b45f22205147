//! Target catalog schemas per descriptive standard
//!
//! A schema lists the fields a row may be mapped onto, with each field's kind
//! (drives type coercion and vocabulary checks), required-ness and synonym
//! list (drives auto-mapping). The field set is a common archival core plus
//! standard-specific extras.

use serde::{Deserialize, Serialize};

/// Supported descriptive standards
pub const KNOWN_STANDARDS: &[&str] = &["isadg", "rad", "dacs", "dc", "spectrum", "cco"];

/// Bumped whenever a built-in field list or synonym set changes
pub const SCHEMA_VERSION: u32 = 3;

/// Value kind of a target field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Date,
    Number,
    Vocabulary { taxonomy: String },
    /// Identifier of this or another record (key / parent reference)
    Reference,
    /// Pipe-delimited list of asset file references
    Asset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetField {
    pub id: String,
    pub label: String,
    pub kind: FieldKind,
    pub required: bool,
    pub synonyms: Vec<String>,
}

/// Start/end field pair where end must not precede start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSchema {
    pub standard: String,
    pub version: u32,
    pub fields: Vec<TargetField>,
    pub date_ranges: Vec<DateRange>,
    /// Field holding the row's own reference (unique within a batch)
    pub key_field: String,
    pub title_field: String,
    pub level_field: String,
    pub asset_field: String,
}

/// Common archival core: (id, kind, synonyms)
const COMMON_FIELDS: &[(&str, Kind, &[&str])] = &[
    ("legacyId", Kind::Reference, &["legacy_id", "legacyid"]),
    ("parentId", Kind::Reference, &["parent_id", "parentid"]),
    ("qubitParentSlug", Kind::Reference, &["parent_slug"]),
    ("identifier", Kind::Text, &["ref_code", "reference_code", "ref"]),
    ("title", Kind::Text, &[]),
    ("levelOfDescription", Kind::Vocab("levelOfDescription"), &["level_of_description", "level"]),
    ("extentAndMedium", Kind::Text, &["extent_and_medium", "extent"]),
    ("repository", Kind::Text, &[]),
    ("archivalHistory", Kind::Text, &["archival_history", "custodial_history"]),
    ("acquisition", Kind::Text, &[]),
    ("scopeAndContent", Kind::Text, &["scope_and_content", "scope", "description"]),
    ("appraisal", Kind::Text, &[]),
    ("accruals", Kind::Text, &[]),
    ("arrangement", Kind::Text, &[]),
    ("accessConditions", Kind::Text, &["access_conditions", "conditions_of_access"]),
    ("reproductionConditions", Kind::Text, &["reproduction_conditions", "conditions_of_reproduction"]),
    ("physicalCharacteristics", Kind::Text, &[]),
    ("findingAids", Kind::Text, &["finding_aids"]),
    ("relatedUnitsOfDescription", Kind::Text, &[]),
    ("locationOfOriginals", Kind::Text, &[]),
    ("locationOfCopies", Kind::Text, &[]),
    ("rules", Kind::Text, &[]),
    ("descriptionIdentifier", Kind::Text, &[]),
    ("descriptionStatus", Kind::Text, &[]),
    ("publicationStatus", Kind::Vocab("publicationStatus"), &["publication_status"]),
    ("levelOfDetail", Kind::Text, &[]),
    ("revisionHistory", Kind::Text, &[]),
    ("sources", Kind::Text, &[]),
    ("culture", Kind::Text, &["language_code"]),
    ("alternateTitle", Kind::Text, &["alternate_title"]),
    ("digitalObjectPath", Kind::Asset, &["digital_object_path", "digital_object", "filename", "file_path"]),
    ("digitalObjectURI", Kind::Text, &["digital_object_uri"]),
    ("digitalObjectChecksum", Kind::Text, &[]),
    ("subjectAccessPoints", Kind::Text, &["subject_access_points", "subjects"]),
    ("placeAccessPoints", Kind::Text, &["place_access_points", "places"]),
    ("nameAccessPoints", Kind::Text, &["name_access_points", "names"]),
    ("genreAccessPoints", Kind::Text, &["genre_access_points", "genres"]),
    ("creators", Kind::Text, &["creator"]),
    ("creatorDates", Kind::Text, &[]),
    ("creatorDatesStart", Kind::Date, &[]),
    ("creatorDatesEnd", Kind::Date, &[]),
    ("creatorDateNotes", Kind::Text, &[]),
    ("creationDates", Kind::Text, &["date", "creation_date"]),
    ("creationDatesStart", Kind::Date, &["start_date"]),
    ("creationDatesEnd", Kind::Date, &["end_date"]),
    ("eventActors", Kind::Text, &[]),
    ("eventTypes", Kind::Text, &[]),
    ("eventDates", Kind::Text, &[]),
    ("eventStartDates", Kind::Date, &[]),
    ("eventEndDates", Kind::Date, &[]),
    ("eventPlaces", Kind::Text, &[]),
    ("physicalObjectName", Kind::Text, &[]),
    ("physicalObjectLocation", Kind::Text, &["physical_location", "storage_location"]),
    ("physicalObjectType", Kind::Text, &[]),
    ("accessionNumber", Kind::Text, &["accession_number"]),
    ("copyrightStatus", Kind::Text, &["copyright_status"]),
    ("copyrightExpires", Kind::Date, &[]),
    ("copyrightHolder", Kind::Text, &[]),
];

const RAD_FIELDS: &[(&str, Kind, &[&str])] = &[
    ("radOtherTitleInformation", Kind::Text, &[]),
    ("radTitleStatementOfResponsibility", Kind::Text, &[]),
    ("radStatementOfProjection", Kind::Text, &[]),
    ("radStatementOfCoordinates", Kind::Text, &[]),
    ("radEdition", Kind::Text, &[]),
    ("radStatementOfScaleCartographic", Kind::Text, &[]),
];

const DACS_FIELDS: &[(&str, Kind, &[&str])] = &[
    ("unitDates", Kind::Text, &[]),
    ("unitDateActuated", Kind::Text, &[]),
];

const DC_FIELDS: &[(&str, Kind, &[&str])] = &[
    ("type", Kind::Text, &[]),
    ("format", Kind::Text, &[]),
    ("language", Kind::Text, &[]),
    ("relation", Kind::Text, &[]),
    ("coverage", Kind::Text, &[]),
    ("contributor", Kind::Text, &[]),
    ("publisher", Kind::Text, &[]),
    ("rights", Kind::Text, &[]),
    ("date", Kind::Date, &[]),
];

const SPECTRUM_FIELDS: &[(&str, Kind, &[&str])] = &[
    ("objectNumber", Kind::Text, &["object_number", "object_no"]),
    ("objectName", Kind::Text, &["object_name"]),
    ("objectType", Kind::Text, &["object_type"]),
    ("objectCount", Kind::Number, &["number_of_objects", "quantity"]),
    ("materialComponent", Kind::Text, &["material"]),
    ("technique", Kind::Text, &[]),
    ("dimension", Kind::Text, &["dimensions"]),
    ("inscription", Kind::Text, &[]),
    ("condition", Kind::Text, &[]),
    ("completeness", Kind::Text, &[]),
];

const CCO_FIELDS: &[(&str, Kind, &[&str])] = &[
    ("workType", Kind::Text, &["work_type"]),
    ("measurements", Kind::Text, &[]),
    ("materialsTechniques", Kind::Text, &["materials_techniques"]),
    ("stylePeriod", Kind::Text, &["style_period"]),
    ("culturalContext", Kind::Text, &["cultural_context"]),
];

/// Compact const-friendly kind used by the field tables above
#[derive(Clone, Copy)]
enum Kind {
    Text,
    Date,
    Number,
    Vocab(&'static str),
    Reference,
    Asset,
}

impl From<Kind> for FieldKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Text => FieldKind::Text,
            Kind::Date => FieldKind::Date,
            Kind::Number => FieldKind::Number,
            Kind::Vocab(taxonomy) => FieldKind::Vocabulary {
                taxonomy: taxonomy.to_string(),
            },
            Kind::Reference => FieldKind::Reference,
            Kind::Asset => FieldKind::Asset,
        }
    }
}

impl TargetSchema {
    /// Built-in schema for a descriptive standard (case-insensitive)
    pub fn for_standard(standard: &str) -> Option<TargetSchema> {
        let standard = standard.trim().to_ascii_lowercase();
        let extras: &[(&str, Kind, &[&str])] = match standard.as_str() {
            "isadg" => &[],
            "rad" => RAD_FIELDS,
            "dacs" => DACS_FIELDS,
            "dc" => DC_FIELDS,
            "spectrum" => SPECTRUM_FIELDS,
            "cco" => CCO_FIELDS,
            _ => return None,
        };

        let required: &[&str] = match standard.as_str() {
            "isadg" => &["title", "levelOfDescription", "identifier"],
            "dc" => &["title"],
            _ => &["title", "levelOfDescription"],
        };

        let fields = COMMON_FIELDS
            .iter()
            .chain(extras.iter())
            .map(|(id, kind, synonyms)| TargetField {
                id: id.to_string(),
                label: humanize(id),
                kind: (*kind).into(),
                required: required.contains(id),
                synonyms: synonyms.iter().map(|s| s.to_string()).collect(),
            })
            .collect();

        let schema = TargetSchema {
            standard,
            version: SCHEMA_VERSION,
            fields,
            date_ranges: vec![
                range("creationDatesStart", "creationDatesEnd"),
                range("creatorDatesStart", "creatorDatesEnd"),
                range("eventStartDates", "eventEndDates"),
            ],
            key_field: "legacyId".to_string(),
            title_field: "title".to_string(),
            level_field: "levelOfDescription".to_string(),
            asset_field: "digitalObjectPath".to_string(),
        };

        Some(schema.without_shadowed_synonyms())
    }

    pub fn field(&self, id: &str) -> Option<&TargetField> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn has_field(&self, id: &str) -> bool {
        self.field(id).is_some()
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &TargetField> {
        self.fields.iter().filter(|f| f.required)
    }

    /// Drop synonyms that equal another field's canonical name
    ///
    /// e.g. Dublin Core has its own `date` field, so `date` must not also be
    /// a synonym of `creationDates`.
    fn without_shadowed_synonyms(mut self) -> Self {
        let canonical: Vec<String> = self.fields.iter().map(|f| normalize_name(&f.id)).collect();
        for field in &mut self.fields {
            let own = normalize_name(&field.id);
            field.synonyms.retain(|syn| {
                let norm = normalize_name(syn);
                norm == own || !canonical.contains(&norm)
            });
        }
        self
    }
}

fn range(start: &str, end: &str) -> DateRange {
    DateRange {
        start: start.to_string(),
        end: end.to_string(),
    }
}

/// Lowercase and strip everything but ASCII letters and digits
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// `levelOfDescription` → `Level of description`
fn humanize(id: &str) -> String {
    let mut out = String::with_capacity(id.len() + 4);
    for (i, c) in id.chars().enumerate() {
        if i == 0 {
            out.push(c.to_ascii_uppercase());
        } else if c.is_ascii_uppercase() {
            out.push(' ');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isadg_required_fields() {
        let schema = TargetSchema::for_standard("ISADG").unwrap();
        let required: Vec<&str> = schema.required_fields().map(|f| f.id.as_str()).collect();
        assert_eq!(required, vec!["identifier", "title", "levelOfDescription"]);
    }

    #[test]
    fn test_dc_requires_only_title_and_owns_date() {
        let schema = TargetSchema::for_standard("dc").unwrap();
        let required: Vec<&str> = schema.required_fields().map(|f| f.id.as_str()).collect();
        assert_eq!(required, vec!["title"]);

        let creation = schema.field("creationDates").unwrap();
        assert!(!creation.synonyms.iter().any(|s| s == "date"));
        assert_eq!(schema.field("date").unwrap().kind, FieldKind::Date);
    }

    #[test]
    fn test_unknown_standard() {
        assert!(TargetSchema::for_standard("marc21").is_none());
    }

    #[test]
    fn test_humanize_and_normalize() {
        assert_eq!(humanize("levelOfDescription"), "Level of description");
        assert_eq!(normalize_name("Level of-Description_"), "levelofdescription");
    }
}
