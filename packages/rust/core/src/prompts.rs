//! Prompt templates for the remote judge.
//!
//! Wording here is business policy; the judge only relies on the JSON shapes
//! the templates ask for.

use leadflow_shared::Record;

pub(crate) fn translate(text: &str, target_language: &str) -> String {
    format!(
        "Translate the following Japanese text into {target_language}. \
         Output only the translation, without explanations.\n\n{text}"
    )
}

pub(crate) fn interpret_metadata(record: &Record, target_language: &str) -> String {
    format!(
        r#"# Role: analyst interpreting Japanese press-release metadata for a {target_language}-speaking sales team
# Task: interpret each source value below into natural {target_language}
# Rules:
# - keep the meaning, rewrite naturally
# - list tags and keywords separated by commas
# - an empty source value stays an empty string
# Output (JSON only): {{"overview": "string", "business_category": "string", "keywords": "string", "location": "string", "related_links": "string"}}
# Input:
# - overview: {overview}
# - business_category: {category}
# - keywords: {keywords}
# - location: {location}
# - related_links: {links}
"#,
        overview = record.overview,
        category = record.business_category,
        keywords = record.keywords,
        location = record.location,
        links = record.related_links,
    )
}

pub(crate) fn suitability(title: &str, translated_title: &str) -> String {
    let translated = if translated_title.trim().is_empty() {
        "(none)"
    } else {
        translated_title
    };
    format!(
        r#"# Role: sales consultant for the Japanese beauty market
# Task: decide whether this news headline works as the congratulatory opener of a cold sales email
# Criteria:
1. relevant to cosmetics or beauty (not fashion or food)
2. positive news: launches, awards, pop-up stores (not disputes, stock prices or earnings)
3. a "congratulations on ..." opening would read naturally
# Output (JSON only): {{"is_suitable": boolean, "reason": "string"}}
# Headline (Japanese): {title}
# Headline (translated): {translated}
"#
    )
}

pub(crate) fn origin(company: &str, address: &str, url: &str, keywords: &str) -> String {
    format!(
        r#"# Role: analyst of global beauty companies
# Task: decide whether this company is a Korean company or Korean-owned (including Japanese subsidiaries)
# Rules:
- Japanese entities of Korean-headquartered brands are "domestic"
- a Japanese headquarters address with a Korean parent brand is still "domestic"
- a .co.kr URL, or Hangul or "Korea" in the company name, means "domestic"
- otherwise "foreign"; when unclear, "unknown"
# Output (JSON only): {{"label": "domestic" | "foreign" | "unknown", "reason": "string"}}
# Input:
- company: {company}
- address: {address}
- url: {url}
- keywords: {keywords}
"#
    )
}
