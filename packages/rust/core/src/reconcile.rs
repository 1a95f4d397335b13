//! Reconciliation engine: idempotent upsert of enriched records into the
//! remote CRM.
//!
//! Identity is the natural key (organization name, contact email), resolved
//! against maps loaded once from the full remote listings before any write.
//! Each record's outcome is written back to the ledger as a status cell, and
//! rows that already carry a status are skipped on later runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use leadflow_crm::{
    ContactDraft, CrmApi, FieldModel, ListEntryDraft, OrganizationDraft, collect_pages,
};
use leadflow_shared::{
    EnrichedRecord, LeadflowError, LedgerRow, OriginPredicate, ReconcileConfig, ReconcileStatus,
    Record, Result, Suitability,
};
use leadflow_storage::LedgerStore;

use crate::processor::SilentProgress;

/// Custom fields written on organizations.
pub const ORGANIZATION_FIELDS: [&str; 3] = ["industry", "headquarters_address", "phone"];

/// Custom fields written on contacts.
pub const CONTACT_FIELDS: [&str; 1] = ["source_article_url"];

/// Fields written on list entries.
pub const LIST_FIELDS: [&str; 5] = [
    "article_title",
    "article_title_translated",
    "article_url",
    "published_at",
    "suitability_reason",
];

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

/// Predicates a ledger row must pass to be reconciled.
#[derive(Debug, Clone)]
pub struct Eligibility {
    pub require_suitable: bool,
    pub origin: OriginPredicate,
    pub require_email: bool,
    /// Lowercase fragments that make an email unusable.
    pub blocked_email_fragments: Vec<String>,
}

impl From<&ReconcileConfig> for Eligibility {
    fn from(config: &ReconcileConfig) -> Self {
        Self {
            require_suitable: config.require_suitable,
            origin: config.origin,
            require_email: config.require_email,
            blocked_email_fragments: config
                .blocked_email_fragments
                .iter()
                .map(|f| f.to_lowercase())
                .filter(|f| !f.is_empty())
                .collect(),
        }
    }
}

impl Eligibility {
    /// The record's email if it can be used for a contact.
    pub fn usable_email<'a>(&self, record: &'a Record) -> Option<&'a str> {
        let email = record.email.trim();
        if email.is_empty() {
            return None;
        }
        let lower = email.to_lowercase();
        if self
            .blocked_email_fragments
            .iter()
            .any(|f| lower.contains(f.as_str()))
        {
            return None;
        }
        Some(email)
    }

    pub fn admits(&self, enriched: &EnrichedRecord) -> bool {
        if self.require_suitable && enriched.verdict.suitability.label != Suitability::Suitable {
            return false;
        }
        if !self.origin.admits(enriched.verdict.origin.label) {
            return false;
        }
        if self.require_email && self.usable_email(&enriched.record).is_none() {
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Progress / report
// ---------------------------------------------------------------------------

/// Per-record progress callback for reconciliation. Advisory only.
pub trait ReconcileProgress: Send + Sync {
    fn record_done(&self, current: usize, total: usize, status: &ReconcileStatus);
}

impl ReconcileProgress for SilentProgress {
    fn record_done(&self, _current: usize, _total: usize, _status: &ReconcileStatus) {}
}

/// Summary of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Rows in the ledger.
    pub rows: usize,
    /// Rows skipped because they already carry a status.
    pub already_flagged: usize,
    /// Rows that failed an eligibility predicate.
    pub ineligible: usize,
    /// Rows attempted by this run.
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Outcomes that could not be written back to the ledger.
    pub status_write_failures: usize,
    pub organizations_created: usize,
    pub contacts_created: usize,
    pub entries_created: usize,
    pub fields_created: usize,
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// Identity maps
// ---------------------------------------------------------------------------

/// Run-local natural-key → remote id caches.
#[derive(Debug, Default)]
struct IdentityMaps {
    /// Organization name → id.
    organizations: HashMap<String, String>,
    /// Lowercase email → contact id.
    contacts: HashMap<String, String>,
    /// Organization id → list entry id.
    entries: HashMap<String, String>,
}

fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Host of an official URL, without a leading `www.`.
pub fn parse_domain(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed = if raw.starts_with("http://") || raw.starts_with("https://") {
        Url::parse(raw)
    } else {
        Url::parse(&format!("https://{raw}"))
    }
    .ok()?;
    let host = parsed.host_str()?;
    let host = host.strip_prefix("www.").unwrap_or(host);
    (!host.is_empty()).then(|| host.to_string())
}

fn non_empty_fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .map(|(k, v)| ((*k).to_string(), v.trim().to_string()))
        .collect()
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Upserts eligible ledger rows into the remote CRM.
pub struct Reconciler {
    crm: Arc<dyn CrmApi>,
    eligibility: Eligibility,
    list_id: Option<String>,
}

impl Reconciler {
    pub fn new(crm: Arc<dyn CrmApi>, eligibility: Eligibility, list_id: Option<String>) -> Self {
        Self {
            crm,
            eligibility,
            list_id,
        }
    }

    /// Reconcile every pending, eligible ledger row.
    ///
    /// Fails only when the ledger cannot be read or the preflight (field
    /// provisioning, identity listing) cannot complete. Per-record failures
    /// are written to the ledger and counted.
    #[instrument(skip_all, fields(list_id = ?self.list_id, origin = ?self.eligibility.origin))]
    pub async fn run(
        &self,
        ledger: &dyn LedgerStore,
        cancel: &CancellationToken,
        progress: &dyn ReconcileProgress,
    ) -> Result<ReconcileReport> {
        let rows = ledger.load()?;
        let mut report = ReconcileReport {
            rows: rows.len(),
            ..Default::default()
        };

        let mut candidates: Vec<(usize, &LedgerRow)> = Vec::new();
        for (idx, row) in rows.iter().enumerate() {
            if !row.status.is_pending() {
                report.already_flagged += 1;
            } else if !self.eligibility.admits(&row.enriched) {
                report.ineligible += 1;
            } else {
                candidates.push((idx, row));
            }
        }

        info!(
            rows = report.rows,
            candidates = candidates.len(),
            already_flagged = report.already_flagged,
            ineligible = report.ineligible,
            "starting reconciliation"
        );
        if candidates.is_empty() {
            return Ok(report);
        }

        report.fields_created = self.provision_fields().await?;
        let mut maps = self.load_identities().await?;

        let total = candidates.len();
        for (current, (idx, row)) in candidates.into_iter().enumerate() {
            if cancel.is_cancelled() {
                info!(attempted = report.attempted, "cancellation requested, stopping");
                report.cancelled = true;
                break;
            }

            report.attempted += 1;
            let status = match self
                .reconcile_record(&row.enriched, &mut maps, &mut report)
                .await
            {
                Ok(()) => {
                    report.succeeded += 1;
                    ReconcileStatus::Done
                }
                Err(e) => {
                    warn!(url = %row.enriched.record.url, error = %e, "record reconciliation failed");
                    report.failed += 1;
                    ReconcileStatus::Failed(e.to_string())
                }
            };

            if let Err(e) = ledger.record_status(idx, &status) {
                warn!(row = idx, error = %e, "failed to record reconciliation status");
                report.status_write_failures += 1;
            }
            progress.record_done(current + 1, total, &status);
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            organizations_created = report.organizations_created,
            contacts_created = report.contacts_created,
            "reconciliation finished"
        );
        Ok(report)
    }

    /// Declare every custom field the run writes that the remote lacks.
    async fn provision_fields(&self) -> Result<usize> {
        let mut created = self
            .ensure_fields(&FieldModel::Organization, &ORGANIZATION_FIELDS)
            .await?;
        created += self
            .ensure_fields(&FieldModel::Contact, &CONTACT_FIELDS)
            .await?;
        if let Some(list_id) = &self.list_id {
            created += self
                .ensure_fields(&FieldModel::List(list_id.clone()), &LIST_FIELDS)
                .await?;
        }
        Ok(created)
    }

    async fn ensure_fields(&self, model: &FieldModel, names: &[&str]) -> Result<usize> {
        let existing: HashSet<String> = self
            .crm
            .list_fields(model)
            .await?
            .into_iter()
            .map(|f| f.name)
            .collect();

        let mut created = 0;
        for name in names.iter().filter(|n| !existing.contains(**n)) {
            self.crm.create_field(model, name).await?;
            info!(%model, field = name, "declared custom field");
            created += 1;
        }
        Ok(created)
    }

    /// Load the full remote collections into natural-key maps.
    async fn load_identities(&self) -> Result<IdentityMaps> {
        let crm = self.crm.as_ref();
        let mut maps = IdentityMaps::default();

        for org in collect_pages(|page| crm.list_organizations(page)).await? {
            let name = org.name.trim().to_string();
            if !name.is_empty() {
                maps.organizations.entry(name).or_insert(org.id);
            }
        }

        for contact in collect_pages(|page| crm.list_contacts(page)).await? {
            let key = email_key(&contact.email);
            if !key.is_empty() {
                maps.contacts.entry(key).or_insert(contact.id);
            }
        }

        if let Some(list_id) = &self.list_id {
            for entry in collect_pages(|page| crm.list_entries(list_id, page)).await? {
                maps.entries.entry(entry.entryable_id).or_insert(entry.id);
            }
        }

        info!(
            organizations = maps.organizations.len(),
            contacts = maps.contacts.len(),
            entries = maps.entries.len(),
            "remote identities loaded"
        );
        Ok(maps)
    }

    /// Organization, then contact, then list entry.
    async fn reconcile_record(
        &self,
        enriched: &EnrichedRecord,
        maps: &mut IdentityMaps,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let record = &enriched.record;
        let name = enriched.organization_name();
        if name.is_empty() {
            return Err(LeadflowError::Record("missing organization name".into()));
        }

        let org = OrganizationDraft {
            name: name.to_string(),
            domain: parse_domain(&record.official_url),
            fields: non_empty_fields(&[
                ("industry", &record.industry),
                ("headquarters_address", &record.address),
                ("phone", &record.phone),
            ]),
        };
        let org_id = match maps.organizations.get(name) {
            Some(id) => {
                let id = id.clone();
                self.update_organization(&id, &org)
                    .await
                    .map_err(|e| stage_error("organization update", e))?;
                id
            }
            None => {
                let id = self
                    .create_organization(&org)
                    .await
                    .map_err(|e| stage_error("organization create", e))?;
                maps.organizations.insert(name.to_string(), id.clone());
                report.organizations_created += 1;
                id
            }
        };
        debug!(org_id = %org_id, name, "organization upserted");

        if let Some(email) = self.eligibility.usable_email(record) {
            let contact = ContactDraft {
                email: email.to_string(),
                organization_id: org_id.clone(),
                fields: non_empty_fields(&[("source_article_url", &record.url)]),
            };
            let key = email_key(email);
            match maps.contacts.get(&key) {
                Some(id) => self
                    .crm
                    .update_contact(id, &contact)
                    .await
                    .map_err(|e| stage_error("contact update", e))?,
                None => {
                    let id = self
                        .crm
                        .create_contact(&contact)
                        .await
                        .map_err(|e| stage_error("contact create", e))?;
                    maps.contacts.insert(key, id);
                    report.contacts_created += 1;
                }
            }
        }

        if let Some(list_id) = &self.list_id {
            let entry = ListEntryDraft {
                organization_id: org_id.clone(),
                fields: non_empty_fields(&[
                    ("article_title", &record.title),
                    ("article_title_translated", &enriched.title_translated),
                    ("article_url", &record.url),
                    ("published_at", &record.published_at),
                    ("suitability_reason", &enriched.verdict.suitability.rationale),
                ]),
            };
            match maps.entries.get(&org_id) {
                Some(entry_id) => self
                    .crm
                    .update_entry(list_id, entry_id, &entry)
                    .await
                    .map_err(|e| stage_error("list entry update", e))?,
                None => {
                    let entry_id = self
                        .crm
                        .create_entry(list_id, &entry)
                        .await
                        .map_err(|e| stage_error("list entry create", e))?;
                    maps.entries.insert(org_id, entry_id);
                    report.entries_created += 1;
                }
            }
        }

        Ok(())
    }

    async fn create_organization(&self, draft: &OrganizationDraft) -> Result<String> {
        match self.crm.create_organization(draft).await {
            Err(LeadflowError::DomainConflict(reason)) => {
                warn!(name = %draft.name, %reason, "domain rejected, retrying without domain");
                self.crm.create_organization(&draft.without_domain()).await
            }
            other => other,
        }
    }

    async fn update_organization(&self, id: &str, draft: &OrganizationDraft) -> Result<()> {
        match self.crm.update_organization(id, draft).await {
            Err(LeadflowError::DomainConflict(reason)) => {
                warn!(name = %draft.name, %reason, "domain rejected, retrying without domain");
                self.crm
                    .update_organization(id, &draft.without_domain())
                    .await
            }
            other => other,
        }
    }
}

fn stage_error(stage: &str, e: LeadflowError) -> LeadflowError {
    LeadflowError::Record(format!("{stage}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryCrm, record};
    use leadflow_crm::RemoteContact;
    use leadflow_shared::{Judgment, MetadataInterpretation, Origin, Verdict};
    use leadflow_storage::CsvLedger;
    use uuid::Uuid;

    fn enriched(n: usize, company: &str, suitability: Suitability, origin: Origin) -> LedgerRow {
        let mut r = record(n, &format!("新作{n:02}発売"));
        r.company = company.into();
        LedgerRow::from(EnrichedRecord {
            record: r,
            title_translated: format!("신작 {n}"),
            company_translated: String::new(),
            metadata: MetadataInterpretation::default(),
            verdict: Verdict {
                suitability: Judgment::new(suitability, "launch"),
                origin: Judgment::new(origin, "JP"),
            },
        })
    }

    fn eligible(n: usize, company: &str) -> LedgerRow {
        enriched(n, company, Suitability::Suitable, Origin::Foreign)
    }

    fn ledger_with(rows: &[LedgerRow]) -> CsvLedger {
        let path = std::env::temp_dir()
            .join(format!("lf-rec-{}", Uuid::now_v7()))
            .join("final.csv");
        let ledger = CsvLedger::new(path);
        ledger.overwrite(rows).unwrap();
        ledger
    }

    fn eligibility() -> Eligibility {
        Eligibility::from(&ReconcileConfig::default())
    }

    fn reconciler(crm: &Arc<InMemoryCrm>, list_id: Option<&str>) -> Reconciler {
        Reconciler::new(
            crm.clone() as Arc<dyn CrmApi>,
            eligibility(),
            list_id.map(String::from),
        )
    }

    async fn run(reconciler: &Reconciler, ledger: &CsvLedger) -> ReconcileReport {
        reconciler
            .run(ledger, &CancellationToken::new(), &SilentProgress)
            .await
            .unwrap()
    }

    #[test]
    fn parse_domain_strips_www_and_path() {
        assert_eq!(
            parse_domain("https://www.lumiere.example.jp/about"),
            Some("lumiere.example.jp".into())
        );
        assert_eq!(parse_domain("lumiere.example.jp"), Some("lumiere.example.jp".into()));
        assert_eq!(parse_domain("  "), None);
        assert_eq!(parse_domain("http://"), None);
    }

    #[test]
    fn eligibility_filters() {
        let e = eligibility();
        assert!(e.admits(&eligible(1, "A社").enriched));
        assert!(!e.admits(&enriched(2, "B社", Suitability::Undetermined, Origin::Foreign).enriched));
        assert!(!e.admits(&enriched(3, "C社", Suitability::Suitable, Origin::Domestic).enriched));
        assert!(!e.admits(&enriched(4, "D社", Suitability::Suitable, Origin::Unknown).enriched));

        let mut wp = eligible(5, "E社");
        wp.enriched.record.email = "wordpress@E.example.jp".into();
        assert!(!e.admits(&wp.enriched));

        let mut no_email = eligible(6, "F社");
        no_email.enriched.record.email = " ".into();
        assert!(!e.admits(&no_email.enriched));

        let lenient = Eligibility {
            origin: OriginPredicate::NotDomestic,
            ..eligibility()
        };
        assert!(lenient.admits(&enriched(4, "D社", Suitability::Suitable, Origin::Unknown).enriched));
    }

    #[tokio::test]
    async fn shared_organization_is_created_once() {
        let crm = Arc::new(InMemoryCrm::default());
        let ledger = ledger_with(&[eligible(1, "ルミエール"), eligible(2, "ルミエール")]);

        let report = run(&reconciler(&crm, None), &ledger).await;

        let calls = crm.calls();
        assert_eq!(calls.org_creates, 1);
        assert_eq!(calls.org_updates, 1);
        assert_eq!(report.organizations_created, 1);
        assert_eq!(report.succeeded, 2);
    }

    #[tokio::test]
    async fn existing_organization_is_only_updated() {
        let crm = Arc::new(InMemoryCrm::with_organizations(&[
            "A", "B", "ルミエール", "C", "D",
        ]));
        let ledger = ledger_with(&[eligible(1, "ルミエール"), eligible(2, "ルミエール")]);

        run(&reconciler(&crm, None), &ledger).await;

        let calls = crm.calls();
        assert_eq!(calls.org_creates, 0);
        assert_eq!(calls.org_updates, 2);
        // five organizations at two per page, plus one empty contact page
        assert_eq!(calls.list_pages, 4);
    }

    #[tokio::test]
    async fn domain_conflict_retries_once_without_domain() {
        let crm = Arc::new(InMemoryCrm {
            rejected_domains: HashSet::from(["test1.example.jp".to_string()]),
            ..Default::default()
        });
        let ledger = ledger_with(&[eligible(1, "ルミエール")]);

        let report = run(&reconciler(&crm, None), &ledger).await;

        assert_eq!(
            crm.calls().org_create_domains,
            vec![Some("test1.example.jp".to_string()), None]
        );
        assert_eq!(report.succeeded, 1);
        assert_eq!(ledger.load().unwrap()[0].status, ReconcileStatus::Done);
    }

    #[tokio::test]
    async fn rerun_skips_flagged_rows() {
        let crm = Arc::new(InMemoryCrm::default());
        let ledger = ledger_with(&[
            eligible(1, "A社"),
            eligible(2, "B社"),
            eligible(3, "C社"),
            eligible(4, "D社"),
        ]);
        ledger.record_status(0, &ReconcileStatus::Done).unwrap();
        ledger
            .record_status(2, &ReconcileStatus::Failed("manual hold".into()))
            .unwrap();

        let report = run(&reconciler(&crm, None), &ledger).await;

        assert_eq!(report.already_flagged, 2);
        assert_eq!(report.attempted, 2);
        assert_eq!(crm.calls().org_creates, 2);

        let rows = ledger.load().unwrap();
        assert_eq!(rows[0].status, ReconcileStatus::Done);
        assert_eq!(rows[1].status, ReconcileStatus::Done);
        assert_eq!(rows[2].status, ReconcileStatus::Failed("manual hold".into()));
        assert_eq!(rows[3].status, ReconcileStatus::Done);

        let again = run(&reconciler(&crm, None), &ledger).await;
        assert_eq!(again.attempted, 0);
        assert_eq!(crm.calls().org_creates, 2);
    }

    #[tokio::test]
    async fn one_failing_record_does_not_stop_the_batch() {
        let crm = Arc::new(InMemoryCrm {
            failing_emails: HashSet::from(["pr@test2.example.jp".to_string()]),
            ..Default::default()
        });
        let ledger = ledger_with(&[eligible(1, "A社"), eligible(2, "B社"), eligible(3, "C社")]);

        let report = run(&reconciler(&crm, None), &ledger).await;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        let rows = ledger.load().unwrap();
        assert_eq!(rows[0].status, ReconcileStatus::Done);
        match &rows[1].status {
            ReconcileStatus::Failed(msg) => assert!(msg.contains("contact create")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(rows[2].status, ReconcileStatus::Done);
    }

    #[tokio::test]
    async fn ineligible_rows_are_left_untouched() {
        let crm = Arc::new(InMemoryCrm::default());
        let ledger = ledger_with(&[
            enriched(1, "A社", Suitability::Unsuitable, Origin::Foreign),
            enriched(2, "B社", Suitability::Suitable, Origin::Domestic),
            eligible(3, "C社"),
        ]);

        let report = run(&reconciler(&crm, None), &ledger).await;

        assert_eq!(report.ineligible, 2);
        assert_eq!(report.succeeded, 1);
        let rows = ledger.load().unwrap();
        assert!(rows[0].status.is_pending());
        assert!(rows[1].status.is_pending());
        assert_eq!(rows[2].status, ReconcileStatus::Done);
    }

    #[tokio::test]
    async fn contacts_match_case_insensitively() {
        let crm = Arc::new(InMemoryCrm::default());
        crm.state.lock().unwrap().contacts.push(RemoteContact {
            id: "contact_existing".into(),
            email: "PR@Test1.Example.jp".into(),
        });
        let ledger = ledger_with(&[eligible(1, "A社")]);

        let report = run(&reconciler(&crm, None), &ledger).await;

        let calls = crm.calls();
        assert_eq!(calls.contact_creates, 0);
        assert_eq!(calls.contact_updates, 1);
        assert_eq!(report.contacts_created, 0);
    }

    #[tokio::test]
    async fn fields_are_provisioned_once_and_list_entries_upserted() {
        let crm = Arc::new(InMemoryCrm::default());
        crm.state
            .lock()
            .unwrap()
            .fields
            .insert(FieldModel::Organization, vec!["industry".into()]);
        let ledger = ledger_with(&[eligible(1, "A社"), eligible(2, "A社"), eligible(3, "B社")]);

        let report = run(&reconciler(&crm, Some("ZBUABR")), &ledger).await;

        let calls = crm.calls();
        assert_eq!(report.fields_created, 2 + 1 + 5);
        assert_eq!(calls.field_creates, 8);
        assert_eq!(calls.entry_creates, 2);
        assert_eq!(calls.entry_updates, 1);
        assert_eq!(report.entries_created, 2);

        let rerun_ledger = ledger_with(&[eligible(4, "C社")]);
        run(&reconciler(&crm, Some("ZBUABR")), &rerun_ledger).await;
        assert_eq!(crm.calls().field_creates, 8);
    }

    #[tokio::test]
    async fn nothing_pending_makes_no_remote_calls() {
        let crm = Arc::new(InMemoryCrm::default());
        let ledger = ledger_with(&[enriched(1, "A社", Suitability::Unsuitable, Origin::Foreign)]);

        run(&reconciler(&crm, Some("ZBUABR")), &ledger).await;

        let calls = crm.calls();
        assert_eq!(calls.list_pages, 0);
        assert_eq!(calls.field_creates, 0);
    }

    #[tokio::test]
    async fn cancelled_run_attempts_nothing() {
        let crm = Arc::new(InMemoryCrm::default());
        let ledger = ledger_with(&[eligible(1, "A社"), eligible(2, "B社")]);
        let token = CancellationToken::new();
        token.cancel();

        let report = reconciler(&crm, None)
            .run(&ledger, &token, &SilentProgress)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.attempted, 0);
        assert_eq!(crm.calls().org_creates, 0);
        assert!(ledger.load().unwrap().iter().all(|r| r.status.is_pending()));
    }
}
