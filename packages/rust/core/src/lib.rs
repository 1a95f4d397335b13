//! Core pipeline logic for leadflow.
//!
//! Enrichment runs raw records through the [`FilterCascade`] and the
//! [`EnrichmentJudge`] (paced by a [`RateGovernor`]) inside the checkpointed
//! [`Processor`]. Reconciliation pushes the resulting ledger into the remote
//! CRM through the idempotent [`Reconciler`].

pub mod filter;
pub mod governor;
pub mod judge;
pub mod notify;
pub mod processor;
mod prompts;
pub mod reconcile;

#[cfg(test)]
pub(crate) mod testing;

pub use filter::FilterCascade;
pub use governor::RateGovernor;
pub use judge::{EnrichmentJudge, RemoteJudge};
pub use notify::{LogNotifier, Notifier, RunSummary};
pub use processor::{
    ProcessProgress, ProcessReport, Processor, ProcessorConfig, RunOutcome, SilentProgress,
};
pub use reconcile::{Eligibility, ReconcileProgress, ReconcileReport, Reconciler};
