//! The ledger: persisted result set of the pipeline.
//!
//! Acts both as the enrichment checkpoint (rewritten in full at every flush)
//! and as the reconciliation status board (single cells updated per row).
//! Every write goes to a sibling temp file that is renamed over the ledger,
//! so readers only ever observe a complete file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use leadflow_shared::{
    EnrichedRecord, Judgment, LeadflowError, LedgerRow, MetadataInterpretation, Origin,
    ReconcileStatus, Record, Result, Suitability, Verdict,
};

/// Reconciliation status column (`done` | `failed` | empty).
pub const STATUS_COLUMN: &str = "crm_status";

/// Reconciliation failure message column.
pub const STATUS_MESSAGE_COLUMN: &str = "crm_message";

/// Fixed column order of the ledger.
pub const LEDGER_COLUMNS: [&str; 28] = [
    "title",
    "title_translated",
    "suitability",
    "suitability_reason",
    "url",
    "published_at",
    "company",
    "company_translated",
    "origin",
    "origin_reason",
    "overview",
    "business_category",
    "keywords",
    "location",
    "related_links",
    "overview_interpreted",
    "business_category_interpreted",
    "keywords_interpreted",
    "location_interpreted",
    "related_links_interpreted",
    "industry",
    "address",
    "phone",
    "official_url",
    "email",
    "contact_url",
    STATUS_COLUMN,
    STATUS_MESSAGE_COLUMN,
];

/// Tabular persisted result set.
pub trait LedgerStore: Send + Sync {
    /// Load every row. A ledger that does not exist yet is empty.
    fn load(&self) -> Result<Vec<LedgerRow>>;

    /// Replace the whole ledger with `rows`.
    fn overwrite(&self, rows: &[LedgerRow]) -> Result<()>;

    /// Set several cells of one row (0-based data row index).
    fn update_cells(&self, row: usize, cells: &[(&str, &str)]) -> Result<()>;

    /// Set a single cell of one row.
    fn update_cell(&self, row: usize, column: &str, value: &str) -> Result<()> {
        self.update_cells(row, &[(column, value)])
    }

    /// Record a reconciliation outcome against a row.
    fn record_status(&self, row: usize, status: &ReconcileStatus) -> Result<()> {
        self.update_cells(
            row,
            &[
                (STATUS_COLUMN, status.status_cell()),
                (STATUS_MESSAGE_COLUMN, status.message_cell()),
            ],
        )
    }
}

// ---------------------------------------------------------------------------
// CSV implementation
// ---------------------------------------------------------------------------

/// Ledger stored as a UTF-8 CSV file.
#[derive(Debug, Clone)]
pub struct CsvLedger {
    path: PathBuf,
}

impl CsvLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn csv_error(&self, e: csv::Error) -> LeadflowError {
        LeadflowError::Storage(format!("{}: {e}", self.path.display()))
    }

    /// Read the raw header and cell grid.
    fn read_raw(&self) -> Result<(Vec<String>, Vec<Vec<String>>)> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| self.csv_error(e))?;

        let headers = reader
            .headers()
            .map_err(|e| self.csv_error(e))?
            .iter()
            .map(normalize_header)
            .collect();

        let mut records = Vec::new();
        for result in reader.records() {
            let record = result.map_err(|e| self.csv_error(e))?;
            records.push(record.iter().map(String::from).collect());
        }
        Ok((headers, records))
    }

    /// Write a header and rows to the temp file, then rename it into place.
    fn write_atomic<I, R>(&self, headers: &[&str], rows: I) -> Result<()>
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator,
        R::Item: AsRef<[u8]>,
    {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| LeadflowError::io(parent, e))?;
            }
        }

        let tmp = self.tmp_path();
        {
            let mut writer = csv::Writer::from_path(&tmp).map_err(|e| self.csv_error(e))?;
            writer
                .write_record(headers)
                .map_err(|e| self.csv_error(e))?;
            for row in rows {
                writer.write_record(row).map_err(|e| self.csv_error(e))?;
            }
            writer.flush().map_err(|e| LeadflowError::io(&tmp, e))?;
        }

        std::fs::rename(&tmp, &self.path).map_err(|e| LeadflowError::io(&self.path, e))
    }
}

impl LedgerStore for CsvLedger {
    fn load(&self) -> Result<Vec<LedgerRow>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let (headers, records) = self.read_raw()?;
        let index: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.as_str(), i))
            .collect();

        let rows = records
            .iter()
            .map(|cells| {
                row_from_cells(|column| {
                    index
                        .get(column)
                        .and_then(|&i| cells.get(i))
                        .map(String::as_str)
                        .unwrap_or("")
                })
            })
            .collect();
        Ok(rows)
    }

    fn overwrite(&self, rows: &[LedgerRow]) -> Result<()> {
        self.write_atomic(
            &LEDGER_COLUMNS,
            rows.iter()
                .map(|row| LEDGER_COLUMNS.iter().map(move |column| cell(row, column))),
        )?;
        tracing::debug!(path = %self.path.display(), rows = rows.len(), "ledger written");
        Ok(())
    }

    fn update_cells(&self, row: usize, cells: &[(&str, &str)]) -> Result<()> {
        let (mut headers, mut records) = if self.path.exists() {
            self.read_raw()?
        } else {
            (Vec::new(), Vec::new())
        };

        if row >= records.len() {
            return Err(LeadflowError::validation(format!(
                "ledger row {row} out of range ({} rows)",
                records.len()
            )));
        }

        for (column, value) in cells {
            let idx = match headers.iter().position(|h| h == column) {
                Some(idx) => idx,
                None => {
                    headers.push((*column).to_string());
                    headers.len() - 1
                }
            };
            let target = &mut records[row];
            if target.len() <= idx {
                target.resize(idx + 1, String::new());
            }
            target[idx] = (*value).to_string();
        }

        let width = headers.len();
        for record in &mut records {
            record.resize(width.max(record.len()), String::new());
        }

        let header_refs: Vec<&str> = headers.iter().map(String::as_str).collect();
        self.write_atomic(&header_refs, records.iter())
    }
}

/// Strip a UTF-8 BOM and surrounding whitespace from a header cell.
fn normalize_header(h: &str) -> String {
    h.trim_start_matches('\u{feff}').trim().to_string()
}

/// Value of `column` for `row`, in ledger spelling.
fn cell<'a>(row: &'a LedgerRow, column: &str) -> &'a str {
    let e = &row.enriched;
    let r = &e.record;
    match column {
        "title" => &r.title,
        "title_translated" => &e.title_translated,
        "suitability" => e.verdict.suitability.label.as_str(),
        "suitability_reason" => &e.verdict.suitability.rationale,
        "url" => &r.url,
        "published_at" => &r.published_at,
        "company" => &r.company,
        "company_translated" => &e.company_translated,
        "origin" => e.verdict.origin.label.as_str(),
        "origin_reason" => &e.verdict.origin.rationale,
        "overview" => &r.overview,
        "business_category" => &r.business_category,
        "keywords" => &r.keywords,
        "location" => &r.location,
        "related_links" => &r.related_links,
        "overview_interpreted" => &e.metadata.overview,
        "business_category_interpreted" => &e.metadata.business_category,
        "keywords_interpreted" => &e.metadata.keywords,
        "location_interpreted" => &e.metadata.location,
        "related_links_interpreted" => &e.metadata.related_links,
        "industry" => &r.industry,
        "address" => &r.address,
        "phone" => &r.phone,
        "official_url" => &r.official_url,
        "email" => &r.email,
        "contact_url" => &r.contact_url,
        STATUS_COLUMN => row.status.status_cell(),
        STATUS_MESSAGE_COLUMN => row.status.message_cell(),
        _ => "",
    }
}

/// Rebuild a row from a column lookup. Missing columns read as empty.
fn row_from_cells<'a>(get: impl Fn(&str) -> &'a str) -> LedgerRow {
    let s = |column: &str| get(column).to_string();

    let record = Record {
        title: s("title"),
        url: s("url"),
        published_at: s("published_at"),
        company: s("company"),
        overview: s("overview"),
        business_category: s("business_category"),
        keywords: s("keywords"),
        location: s("location"),
        related_links: s("related_links"),
        industry: s("industry"),
        address: s("address"),
        phone: s("phone"),
        official_url: s("official_url"),
        email: s("email"),
        contact_url: s("contact_url"),
    };

    LedgerRow {
        enriched: EnrichedRecord {
            record,
            title_translated: s("title_translated"),
            company_translated: s("company_translated"),
            metadata: MetadataInterpretation {
                overview: s("overview_interpreted"),
                business_category: s("business_category_interpreted"),
                keywords: s("keywords_interpreted"),
                location: s("location_interpreted"),
                related_links: s("related_links_interpreted"),
            },
            verdict: Verdict {
                suitability: Judgment::new(
                    Suitability::from_cell(get("suitability")),
                    s("suitability_reason"),
                ),
                origin: Judgment::new(Origin::from_cell(get("origin")), s("origin_reason")),
            },
        },
        status: ReconcileStatus::from_cells(get(STATUS_COLUMN), get(STATUS_MESSAGE_COLUMN)),
    }
}
