//! Static controlled vocabularies

use std::collections::HashMap;

use super::VocabularyLookup;

const LEVELS_OF_DESCRIPTION: &[&str] = &[
    "Fonds",
    "Subfonds",
    "Collection",
    "Series",
    "Subseries",
    "File",
    "Item",
    "Part",
    "Record group",
    "Sub-item",
];

const PUBLICATION_STATUSES: &[&str] = &["Draft", "Published"];

/// In-memory taxonomy → terms table; matching is case-insensitive
#[derive(Debug, Clone)]
pub struct StaticVocabulary {
    taxonomies: HashMap<String, Vec<String>>,
}

impl StaticVocabulary {
    pub fn empty() -> Self {
        Self {
            taxonomies: HashMap::new(),
        }
    }

    pub fn with_taxonomy(mut self, taxonomy: &str, terms: &[&str]) -> Self {
        self.taxonomies.insert(
            taxonomy.to_string(),
            terms.iter().map(|t| t.to_lowercase()).collect(),
        );
        self
    }
}

impl Default for StaticVocabulary {
    fn default() -> Self {
        Self::empty()
            .with_taxonomy("levelOfDescription", LEVELS_OF_DESCRIPTION)
            .with_taxonomy("publicationStatus", PUBLICATION_STATUSES)
    }
}

impl VocabularyLookup for StaticVocabulary {
    /// Unknown taxonomies accept every value
    fn is_valid_term(&self, taxonomy: &str, value: &str) -> bool {
        match self.taxonomies.get(taxonomy) {
            Some(terms) => {
                let value = value.trim().to_lowercase();
                terms.iter().any(|t| *t == value)
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let vocab = StaticVocabulary::default();
        assert!(vocab.is_valid_term("levelOfDescription", "fonds"));
        assert!(vocab.is_valid_term("levelOfDescription", " Sub-item "));
        assert!(!vocab.is_valid_term("levelOfDescription", "Folder"));
        assert!(vocab.is_valid_term("genre", "anything"));
    }
}
