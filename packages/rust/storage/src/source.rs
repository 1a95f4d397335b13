//! Raw record sources.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use leadflow_shared::{LeadflowError, Record, Result};

/// Ordered, finite collection of scraped records.
pub trait RecordSource: Send + Sync {
    /// Load all records in source order.
    fn load(&self) -> Result<Vec<Record>>;
}

/// Raw records read from a headered CSV export of the scraper.
#[derive(Debug, Clone)]
pub struct CsvRecordSource {
    path: PathBuf,
}

impl CsvRecordSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSource for CsvRecordSource {
    fn load(&self) -> Result<Vec<Record>> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| LeadflowError::Storage(format!("{}: {e}", self.path.display())))?;

        let mut seen = HashSet::new();
        let mut records = Vec::new();

        for (i, result) in reader.deserialize::<Record>().enumerate() {
            // Header is line 1
            let line = i + 2;
            let record = result.map_err(|e| {
                LeadflowError::parse(format!("{} line {line}: {e}", self.path.display()))
            })?;

            if record.title.trim().is_empty() || record.url.trim().is_empty() {
                return Err(LeadflowError::validation(format!(
                    "{} line {line}: title and url are required",
                    self.path.display()
                )));
            }

            if !seen.insert(record.url.clone()) {
                tracing::warn!(url = %record.url, line, "duplicate url in source, keeping first");
                continue;
            }
            records.push(record);
        }

        tracing::debug!(path = %self.path.display(), count = records.len(), "records loaded");
        Ok(records)
    }
}
