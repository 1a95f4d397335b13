//! Checkpointed processor: drives every record through filter → judge →
//! merge and snapshots the accumulated result set to the ledger.
//!
//! The in-memory buffer is the source of truth for a run. The ledger is a
//! derived snapshot, rewritten in full every `checkpoint_interval` records
//! and once more when the run ends (completion, early stop or cancellation).

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use leadflow_shared::{
    EnrichedRecord, Judgment, LedgerRow, MetadataInterpretation, Origin, PipelineConfig, Record,
    Result, Suitability, Verdict,
};
use leadflow_storage::{LedgerStore, RecordSource};

use crate::filter::FilterCascade;
use crate::judge::EnrichmentJudge;

/// Rationale attached to the origin of a locally rejected record.
const ORIGIN_NOT_EVALUATED: &str = "not evaluated: rejected by local filter";

/// Processor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Flush the buffer after this many newly processed records.
    pub checkpoint_interval: usize,
    /// Stop when the first M records are all `unsuitable`. `None` disables.
    pub early_stop: Option<usize>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 5,
            early_stop: Some(10),
        }
    }
}

impl From<&PipelineConfig> for ProcessorConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            checkpoint_interval: config.checkpoint_interval.max(1),
            early_stop: (config.early_stop_after > 0).then_some(config.early_stop_after),
        }
    }
}

/// Per-record progress callback. Advisory only.
pub trait ProcessProgress: Send + Sync {
    /// Rows carried over from an existing ledger.
    fn resumed(&self, rows: usize);
    /// One record finished; `current` of `total` pending records.
    fn record_done(&self, url: &str, current: usize, total: usize, suitability: Suitability);
    /// The ledger was rewritten with `rows` rows.
    fn checkpoint(&self, rows: usize);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProcessProgress for SilentProgress {
    fn resumed(&self, _rows: usize) {}
    fn record_done(&self, _url: &str, _current: usize, _total: usize, _s: Suitability) {}
    fn checkpoint(&self, _rows: usize) {}
}

/// How a processing run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    EarlyStop,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::EarlyStop => "early_stop",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Summary of one processing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    /// Distinct records in the source.
    pub total: usize,
    /// Rows carried over from the existing ledger.
    pub resumed: usize,
    /// Records processed by this run.
    pub processed: usize,
    /// Of those, rejected by the local filter without a remote call.
    pub rejected_locally: usize,
    /// Rows in the ledger after the run.
    pub rows: usize,
    /// Ledger rows decided `suitable`.
    pub suitable: usize,
    /// Ledger rows left `undetermined`.
    pub undetermined: usize,
    pub outcome: RunOutcome,
}

/// Drives records through the filter cascade and the judge.
pub struct Processor {
    judge: Arc<dyn EnrichmentJudge>,
    filters: FilterCascade,
    config: ProcessorConfig,
}

impl Processor {
    pub fn new(
        judge: Arc<dyn EnrichmentJudge>,
        filters: FilterCascade,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            judge,
            filters,
            config,
        }
    }

    /// Process every source record not yet in the ledger.
    ///
    /// Fails only if the source or the ledger cannot be read, or a checkpoint
    /// cannot be written. Remote failures degrade individual verdicts.
    #[instrument(skip_all, fields(
        checkpoint_interval = self.config.checkpoint_interval,
        early_stop = ?self.config.early_stop,
    ))]
    pub async fn run(
        &self,
        source: &dyn RecordSource,
        ledger: &dyn LedgerStore,
        cancel: &CancellationToken,
        progress: &dyn ProcessProgress,
    ) -> Result<ProcessReport> {
        let records = source.load()?;
        let mut buffer = ledger.load()?;
        let resumed = buffer.len();

        let known: HashSet<&str> = buffer
            .iter()
            .map(|row| row.enriched.record.url.as_str())
            .collect();
        let pending: Vec<&Record> = records
            .iter()
            .filter(|r| !known.contains(r.url.as_str()))
            .collect();
        let pending_total = pending.len();

        info!(
            total = records.len(),
            resumed,
            pending = pending_total,
            "starting enrichment"
        );
        if resumed > 0 {
            progress.resumed(resumed);
        }

        let mut processed = 0;
        let mut rejected_locally = 0;
        let mut unflushed = 0;
        let mut outcome = RunOutcome::Completed;

        if self.early_stop_reached(&buffer) {
            info!(rows = resumed, "early-stop condition already met by existing ledger");
            outcome = RunOutcome::EarlyStop;
        } else {
            for record in pending {
                if cancel.is_cancelled() {
                    info!(processed, "cancellation requested, stopping before next record");
                    outcome = RunOutcome::Cancelled;
                    break;
                }

                let (enriched, was_rejected) = self.process_record(record).await;
                processed += 1;
                unflushed += 1;
                if was_rejected {
                    rejected_locally += 1;
                }
                progress.record_done(
                    &record.url,
                    processed,
                    pending_total,
                    enriched.verdict.suitability.label,
                );
                buffer.push(LedgerRow::from(enriched));

                if unflushed >= self.config.checkpoint_interval {
                    self.flush(ledger, &buffer, progress)?;
                    unflushed = 0;
                }

                if self
                    .config
                    .early_stop
                    .is_some_and(|m| buffer.len() == m)
                    && self.early_stop_reached(&buffer)
                {
                    info!(
                        rows = buffer.len(),
                        "first records all unsuitable, stopping early"
                    );
                    outcome = RunOutcome::EarlyStop;
                    break;
                }
            }
        }

        if unflushed > 0 || buffer.is_empty() {
            self.flush(ledger, &buffer, progress)?;
        }

        let report = ProcessReport {
            total: records.len(),
            resumed,
            processed,
            rejected_locally,
            rows: buffer.len(),
            suitable: count(&buffer, Suitability::Suitable),
            undetermined: count(&buffer, Suitability::Undetermined),
            outcome,
        };
        info!(
            processed = report.processed,
            rows = report.rows,
            suitable = report.suitable,
            outcome = report.outcome.as_str(),
            "enrichment finished"
        );
        Ok(report)
    }

    fn flush(
        &self,
        ledger: &dyn LedgerStore,
        buffer: &[LedgerRow],
        progress: &dyn ProcessProgress,
    ) -> Result<()> {
        ledger.overwrite(buffer)?;
        debug!(rows = buffer.len(), "checkpoint flushed");
        progress.checkpoint(buffer.len());
        Ok(())
    }

    /// Whether the first M rows exist and are all confirmed `unsuitable`.
    fn early_stop_reached(&self, buffer: &[LedgerRow]) -> bool {
        match self.config.early_stop {
            Some(m) if buffer.len() >= m => buffer[..m]
                .iter()
                .all(|row| row.enriched.verdict.suitability.label == Suitability::Unsuitable),
            _ => false,
        }
    }

    /// Enrich one record. The flag reports a local-filter rejection.
    async fn process_record(&self, record: &Record) -> (EnrichedRecord, bool) {
        if let Some(keyword) = self.filters.rejection(record) {
            debug!(url = %record.url, keyword, "rejected by local filter");
            let origin = match self.filters.domestic_marker(record) {
                Some(marker) => domestic(marker),
                None => Judgment::new(Origin::Unknown, ORIGIN_NOT_EVALUATED),
            };
            let enriched = EnrichedRecord {
                record: record.clone(),
                title_translated: String::new(),
                company_translated: String::new(),
                metadata: MetadataInterpretation::default(),
                verdict: Verdict {
                    suitability: Judgment::new(
                        Suitability::Unsuitable,
                        format!("rejected by local filter: {keyword}"),
                    ),
                    origin,
                },
            };
            return (enriched, true);
        }

        let judge = self.judge.as_ref();
        let (company_translated, metadata, origin, (title_translated, suitability)) = tokio::join!(
            judge.translate(&record.company),
            judge.interpret_metadata(record),
            self.origin(record),
            async {
                let translated = judge.translate(&record.title).await;
                let suitability = judge.judge_suitability(&record.title, &translated).await;
                (translated, suitability)
            },
        );

        let enriched = EnrichedRecord {
            record: record.clone(),
            title_translated,
            company_translated,
            metadata,
            verdict: Verdict {
                suitability,
                origin,
            },
        };
        (enriched, false)
    }

    /// Local domestic marker first; the remote judge only when it is absent.
    async fn origin(&self, record: &Record) -> Judgment<Origin> {
        if let Some(marker) = self.filters.domestic_marker(record) {
            return domestic(marker);
        }
        self.judge
            .judge_origin(
                &record.company,
                &record.address,
                &record.official_url,
                &record.keywords,
            )
            .await
    }
}

fn domestic(marker: &str) -> Judgment<Origin> {
    Judgment::new(
        Origin::Domestic,
        format!("domestic marker in keywords: {marker}"),
    )
}

fn count(buffer: &[LedgerRow], label: Suitability) -> usize {
    buffer
        .iter()
        .filter(|row| row.enriched.verdict.suitability.label == label)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::RateGovernor;
    use crate::judge::RemoteJudge;
    use crate::testing::{
        CountingLedger, PromptKind, ScriptedInference, VecSource, canned, record,
    };
    use leadflow_inference::InferenceService;
    use leadflow_shared::{
        FiltersConfig, LeadflowError, NO_CREDENTIAL_RATIONALE, ReconcileStatus,
    };
    use leadflow_storage::CsvLedger;
    use std::time::Duration;
    use uuid::Uuid;

    fn temp_ledger() -> CountingLedger<CsvLedger> {
        let path = std::env::temp_dir()
            .join(format!("lf-proc-{}", Uuid::now_v7()))
            .join("final.csv");
        CountingLedger::new(CsvLedger::new(path))
    }

    fn online(service: Arc<ScriptedInference>) -> Arc<dyn EnrichmentJudge> {
        let governor = Arc::new(RateGovernor::new(1000, Duration::from_secs(60)).unwrap());
        Arc::new(RemoteJudge::new(
            Some(service as Arc<dyn InferenceService>),
            governor,
        ))
    }

    fn offline() -> Arc<dyn EnrichmentJudge> {
        let governor = Arc::new(RateGovernor::new(1, Duration::from_secs(60)).unwrap());
        Arc::new(RemoteJudge::new(None, governor))
    }

    fn processor(judge: Arc<dyn EnrichmentJudge>, config: ProcessorConfig) -> Processor {
        Processor::new(
            judge,
            FilterCascade::from_config(&FiltersConfig::default()),
            config,
        )
    }

    fn titles(n: usize) -> Vec<Record> {
        (1..=n).map(|i| record(i, &format!("新作{i:02}発売"))).collect()
    }

    async fn run(
        processor: &Processor,
        records: Vec<Record>,
        ledger: &dyn LedgerStore,
    ) -> ProcessReport {
        processor
            .run(
                &VecSource(records),
                ledger,
                &CancellationToken::new(),
                &SilentProgress,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn rejected_records_never_reach_the_judge() {
        let service = Arc::new(ScriptedInference::answering(true));
        let p = processor(online(service.clone()), ProcessorConfig::default());
        let ledger = temp_ledger();

        let records = vec![
            record(1, "2025年12月期 決算説明会のお知らせ"),
            record(2, "【人事】役員異動"),
        ];
        let report = run(&p, records, &ledger).await;

        assert_eq!(service.calls(), 0);
        assert_eq!(report.rejected_locally, 2);
        let rows = ledger.load().unwrap();
        assert!(rows.iter().all(|r| {
            r.enriched.verdict.suitability.label == Suitability::Unsuitable
                && r.enriched.title_translated.is_empty()
        }));
        assert_eq!(
            rows[0].enriched.verdict.suitability.rationale,
            "rejected by local filter: 決算"
        );
    }

    #[tokio::test]
    async fn offline_three_record_scenario() {
        let p = processor(offline(), ProcessorConfig::default());
        let ledger = temp_ledger();

        let mut korean = record(2, "クッションファンデ日本上陸");
        korean.keywords = "韓国コスメ,ファンデ".into();
        let records = vec![
            record(1, "商品回収のお詫び"),
            korean,
            record(3, "新作リップ発売"),
        ];
        let report = run(&p, records, &ledger).await;
        assert_eq!(report.processed, 3);
        assert_eq!(report.undetermined, 2);

        let rows = ledger.load().unwrap();
        let a = &rows[0].enriched.verdict;
        assert_eq!(a.suitability.label, Suitability::Unsuitable);
        assert!(a.suitability.rationale.contains("回収"));

        let b = &rows[1].enriched.verdict;
        assert_eq!(b.origin.label, Origin::Domestic);
        assert!(b.origin.rationale.contains("韓国"));

        let c = &rows[2].enriched.verdict;
        assert_eq!(c.suitability.label, Suitability::Undetermined);
        assert_eq!(c.suitability.rationale, NO_CREDENTIAL_RATIONALE);
        assert_eq!(c.origin.label, Origin::Unknown);
    }

    #[tokio::test]
    async fn domestic_marker_skips_remote_origin_call() {
        let service = Arc::new(ScriptedInference::answering(true));
        let p = processor(online(service.clone()), ProcessorConfig::default());
        let ledger = temp_ledger();

        let mut korean = record(1, "クッションファンデ日本上陸");
        korean.keywords = "K-beauty".into();
        let records = vec![korean, record(2, "新作リップ発売")];
        run(&p, records, &ledger).await;

        assert_eq!(service.calls_for(PromptKind::Origin), 1);
        assert_eq!(service.calls_for(PromptKind::Suitability), 2);
        let rows = ledger.load().unwrap();
        assert_eq!(rows[0].enriched.verdict.origin.label, Origin::Domestic);
        assert_eq!(rows[1].enriched.verdict.origin.label, Origin::Foreign);
        assert_eq!(rows[1].enriched.title_translated, "번역문");
        assert_eq!(rows[1].enriched.metadata.business_category, "");
    }

    #[tokio::test]
    async fn flushes_every_k_records_and_at_the_end() {
        let p = processor(
            offline(),
            ProcessorConfig {
                checkpoint_interval: 5,
                early_stop: None,
            },
        );
        let ledger = temp_ledger();
        let report = run(&p, titles(12), &ledger).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(ledger.flushes(), vec![5, 10, 12]);
        let urls: Vec<String> = ledger
            .load()
            .unwrap()
            .into_iter()
            .map(|r| r.enriched.record.url)
            .collect();
        let expected: Vec<String> = titles(12).into_iter().map(|r| r.url).collect();
        assert_eq!(urls, expected);
    }

    #[tokio::test]
    async fn early_stop_after_m_unsuitable() {
        let service = Arc::new(ScriptedInference::answering(false));
        let p = processor(
            online(service.clone()),
            ProcessorConfig {
                checkpoint_interval: 5,
                early_stop: Some(10),
            },
        );
        let ledger = temp_ledger();
        let report = run(&p, titles(15), &ledger).await;

        assert_eq!(report.outcome, RunOutcome::EarlyStop);
        assert_eq!(report.processed, 10);
        assert_eq!(service.calls_for(PromptKind::Suitability), 10);
        assert_eq!(service.calls_mentioning("新作11"), 0);
        assert_eq!(service.calls_mentioning("テスト11"), 0);
        assert_eq!(ledger.load().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn undetermined_does_not_trigger_early_stop() {
        let service = Arc::new(ScriptedInference::new(|kind, prompt| {
            if kind == PromptKind::Suitability && prompt.contains("新作03") {
                Err(LeadflowError::Transport("HTTP 500".into()))
            } else {
                Ok(canned(kind, false))
            }
        }));
        let p = processor(
            online(service.clone()),
            ProcessorConfig {
                checkpoint_interval: 5,
                early_stop: Some(10),
            },
        );
        let ledger = temp_ledger();
        let report = run(&p, titles(15), &ledger).await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.processed, 15);
        assert_eq!(report.undetermined, 1);
    }

    #[tokio::test]
    async fn resume_skips_flushed_records_and_keeps_statuses() {
        let service = Arc::new(ScriptedInference::answering(true));
        let p = processor(online(service.clone()), ProcessorConfig::default());
        let ledger = temp_ledger();

        run(&p, titles(4), &ledger).await;
        ledger.record_status(0, &ReconcileStatus::Done).unwrap();
        let calls_after_first = service.calls_for(PromptKind::Suitability);
        assert_eq!(calls_after_first, 4);

        let report = run(&p, titles(6), &ledger).await;
        assert_eq!(report.resumed, 4);
        assert_eq!(report.processed, 2);
        assert_eq!(report.rows, 6);
        assert_eq!(service.calls_for(PromptKind::Suitability), 6);

        let rows = ledger.load().unwrap();
        assert_eq!(rows[0].status, ReconcileStatus::Done);
        assert!(rows[5].status.is_pending());
    }

    #[tokio::test]
    async fn resumed_early_stop_processes_nothing() {
        let service = Arc::new(ScriptedInference::answering(false));
        let config = ProcessorConfig {
            checkpoint_interval: 5,
            early_stop: Some(3),
        };
        let ledger = temp_ledger();
        run(&processor(online(service.clone()), config), titles(3), &ledger).await;
        let before = service.calls();

        let report = run(&processor(online(service.clone()), config), titles(8), &ledger).await;
        assert_eq!(report.outcome, RunOutcome::EarlyStop);
        assert_eq!(report.processed, 0);
        assert_eq!(service.calls(), before);
    }

    struct CancelAfter {
        token: CancellationToken,
        after: usize,
    }

    impl ProcessProgress for CancelAfter {
        fn resumed(&self, _rows: usize) {}
        fn record_done(&self, _url: &str, current: usize, _total: usize, _s: Suitability) {
            if current == self.after {
                self.token.cancel();
            }
        }
        fn checkpoint(&self, _rows: usize) {}
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_record_and_flushes() {
        let p = processor(
            offline(),
            ProcessorConfig {
                checkpoint_interval: 5,
                early_stop: None,
            },
        );
        let ledger = temp_ledger();
        let token = CancellationToken::new();
        let progress = CancelAfter {
            token: token.clone(),
            after: 3,
        };

        let report = p
            .run(&VecSource(titles(8)), &ledger, &token, &progress)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.processed, 3);
        assert_eq!(ledger.flushes(), vec![3]);
        assert_eq!(ledger.load().unwrap().len(), 3);
    }

    struct BrokenSource;

    impl RecordSource for BrokenSource {
        fn load(&self) -> Result<Vec<Record>> {
            Err(LeadflowError::validation("line 2: title and url are required"))
        }
    }

    #[tokio::test]
    async fn source_failure_aborts_before_processing() {
        let service = Arc::new(ScriptedInference::answering(true));
        let p = processor(online(service.clone()), ProcessorConfig::default());
        let ledger = temp_ledger();

        let result = p
            .run(
                &BrokenSource,
                &ledger,
                &CancellationToken::new(),
                &SilentProgress,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(service.calls(), 0);
        assert!(ledger.flushes().is_empty());
    }

    #[test]
    fn zero_early_stop_disables_policy() {
        let config = ProcessorConfig::from(&PipelineConfig {
            checkpoint_interval: 0,
            early_stop_after: 0,
        });
        assert_eq!(config.early_stop, None);
        assert_eq!(config.checkpoint_interval, 1);
    }
}
