//! Deterministic keyword rules evaluated before any remote call.

use leadflow_shared::{FiltersConfig, Record};

/// Local filter cascade.
///
/// Matching is case-sensitive substring search on the native-language text.
#[derive(Debug, Clone, Default)]
pub struct FilterCascade {
    negative_keywords: Vec<String>,
    domestic_keywords: Vec<String>,
}

impl FilterCascade {
    pub fn new(negative_keywords: Vec<String>, domestic_keywords: Vec<String>) -> Self {
        Self {
            negative_keywords: non_empty(negative_keywords),
            domestic_keywords: non_empty(domestic_keywords),
        }
    }

    pub fn from_config(config: &FiltersConfig) -> Self {
        Self::new(
            config.negative_keywords.clone(),
            config.domestic_keywords.clone(),
        )
    }

    /// The first negative keyword found in the record's title, if any.
    pub fn rejection(&self, record: &Record) -> Option<&str> {
        self.negative_keywords
            .iter()
            .find(|kw| record.title.contains(kw.as_str()))
            .map(String::as_str)
    }

    pub fn admits(&self, record: &Record) -> bool {
        self.rejection(record).is_none()
    }

    /// The first domestic-market marker found in the record's keyword field.
    pub fn domestic_marker(&self, record: &Record) -> Option<&str> {
        let keywords = record.keywords.trim();
        if keywords.is_empty() {
            return None;
        }
        self.domestic_keywords
            .iter()
            .find(|kw| keywords.contains(kw.as_str()))
            .map(String::as_str)
    }
}

/// An empty keyword would match every text.
fn non_empty(keywords: Vec<String>) -> Vec<String> {
    keywords.into_iter().filter(|k| !k.is_empty()).collect()
}
