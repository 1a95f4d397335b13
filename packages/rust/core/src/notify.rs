//! End-of-run notification.

use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use leadflow_shared::RunId;

use crate::processor::ProcessReport;

/// What a finished enrichment run hands to its notifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub total: usize,
    pub suitable: usize,
    /// The ledger the run produced.
    pub artifact: PathBuf,
}

impl RunSummary {
    pub fn from_report(run_id: RunId, report: &ProcessReport, artifact: PathBuf) -> Self {
        Self {
            run_id,
            total: report.rows,
            suitable: report.suitable,
            artifact,
        }
    }
}

/// Delivers a [`RunSummary`] somewhere.
pub trait Notifier: Send + Sync {
    fn notify(&self, summary: &RunSummary);
}

/// Notifier that emits the summary as a structured log event.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, summary: &RunSummary) {
        info!(
            run_id = %summary.run_id,
            total = summary.total,
            suitable = summary.suitable,
            artifact = %summary.artifact.display(),
            "enrichment run complete"
        );
    }
}
