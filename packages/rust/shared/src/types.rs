//! Core domain types for the enrichment and reconciliation pipeline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rationale recorded when no inference credential is configured.
pub const NO_CREDENTIAL_RATIONALE: &str = "no credential";

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One scraped news item with its company metadata.
///
/// Produced by a record source and never mutated afterwards; the pipeline
/// only attaches derived fields around it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Article title in its native language.
    pub title: String,
    /// Article URL. Unique key of the record.
    pub url: String,
    /// Publication timestamp as printed by the source.
    #[serde(default)]
    pub published_at: String,
    /// Company name as printed by the source.
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub overview: String,
    #[serde(default)]
    pub business_category: String,
    /// Free-text keyword list attached to the article.
    #[serde(default)]
    pub keywords: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub related_links: String,
    #[serde(default)]
    pub industry: String,
    /// Headquarters address.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub phone: String,
    /// Official company website.
    #[serde(default)]
    pub official_url: String,
    /// Contact email found in the article body.
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub contact_url: String,
}

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// Tri-state suitability outcome.
///
/// `Undetermined` means "could not be decided" and is never an explicit
/// negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suitability {
    Suitable,
    Unsuitable,
    Undetermined,
}

impl Suitability {
    /// Canonical ledger spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suitable => "suitable",
            Self::Unsuitable => "unsuitable",
            Self::Undetermined => "undetermined",
        }
    }

    /// Parse a ledger cell, accepting legacy boolean spellings.
    ///
    /// Anything unrecognised (including an empty cell) is `Undetermined`.
    pub fn from_cell(cell: &str) -> Self {
        match cell.trim().to_ascii_lowercase().as_str() {
            "suitable" | "true" => Self::Suitable,
            "unsuitable" | "false" => Self::Unsuitable,
            _ => Self::Undetermined,
        }
    }
}

impl std::fmt::Display for Suitability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Company origin relative to the home market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Domestic,
    Foreign,
    Unknown,
}

impl Origin {
    /// Canonical ledger spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Domestic => "domestic",
            Self::Foreign => "foreign",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a ledger cell or remote label. Unrecognised values are `Unknown`.
    pub fn from_cell(cell: &str) -> Self {
        match cell.trim().to_ascii_lowercase().as_str() {
            "domestic" => Self::Domestic,
            "foreign" => Self::Foreign,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A label together with the rationale that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Judgment<T> {
    pub label: T,
    pub rationale: String,
}

impl<T> Judgment<T> {
    pub fn new(label: T, rationale: impl Into<String>) -> Self {
        Self {
            label,
            rationale: rationale.into(),
        }
    }
}

/// Structured classification result for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub suitability: Judgment<Suitability>,
    pub origin: Judgment<Origin>,
}

/// Target-language interpretation of the free-text metadata fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataInterpretation {
    #[serde(default)]
    pub overview: String,
    #[serde(default)]
    pub business_category: String,
    #[serde(default)]
    pub keywords: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub related_links: String,
}

// ---------------------------------------------------------------------------
// EnrichedRecord / LedgerRow
// ---------------------------------------------------------------------------

/// A record with its verdict and translated fields attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub record: Record,
    pub title_translated: String,
    pub company_translated: String,
    pub metadata: MetadataInterpretation,
    pub verdict: Verdict,
}

impl EnrichedRecord {
    /// Whether this record was decided `suitable`.
    pub fn is_suitable(&self) -> bool {
        self.verdict.suitability.label == Suitability::Suitable
    }

    /// Organization name used for reconciliation: translated name first,
    /// falling back to the source spelling.
    pub fn organization_name(&self) -> &str {
        let translated = self.company_translated.trim();
        if translated.is_empty() {
            self.record.company.trim()
        } else {
            translated
        }
    }
}

/// Reconciliation outcome recorded against a ledger row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReconcileStatus {
    /// Not yet attempted (empty status cell).
    #[default]
    Pending,
    Done,
    Failed(String),
}

impl ReconcileStatus {
    /// Ledger spelling of the status cell.
    pub fn status_cell(&self) -> &'static str {
        match self {
            Self::Pending => "",
            Self::Done => "done",
            Self::Failed(_) => "failed",
        }
    }

    /// Ledger spelling of the message cell.
    pub fn message_cell(&self) -> &str {
        match self {
            Self::Failed(message) => message,
            _ => "",
        }
    }

    /// Rebuild a status from its two ledger cells.
    ///
    /// Any non-empty status other than `done` counts as attempted-and-failed
    /// so that reruns never retry rows a human has flagged.
    pub fn from_cells(status: &str, message: &str) -> Self {
        match status.trim() {
            "" => Self::Pending,
            "done" => Self::Done,
            _ => Self::Failed(message.to_string()),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// One row of the ledger: an enriched record plus its reconciliation status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub enriched: EnrichedRecord,
    pub status: ReconcileStatus,
}

impl From<EnrichedRecord> for LedgerRow {
    fn from(enriched: EnrichedRecord) -> Self {
        Self {
            enriched,
            status: ReconcileStatus::Pending,
        }
    }
}
