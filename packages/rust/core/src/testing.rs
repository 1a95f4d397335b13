//! Deterministic fakes for pipeline tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use leadflow_crm::{
    ContactDraft, CrmApi, FieldDeclaration, FieldModel, ListEntryDraft, OrganizationDraft, Page,
    RemoteContact, RemoteListEntry, RemoteOrganization,
};
use leadflow_inference::InferenceService;
use leadflow_shared::{LeadflowError, Record, Result};
use leadflow_storage::{LedgerStore, RecordSource};

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

/// Which judge operation a prompt belongs to, recognised by its output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PromptKind {
    Translate,
    Metadata,
    Suitability,
    Origin,
}

pub(crate) fn kind_of(prompt: &str) -> PromptKind {
    if prompt.contains(r#""is_suitable""#) {
        PromptKind::Suitability
    } else if prompt.contains(r#""label""#) {
        PromptKind::Origin
    } else if prompt.contains(r#""business_category""#) {
        PromptKind::Metadata
    } else {
        PromptKind::Translate
    }
}

type Responder = Box<dyn Fn(PromptKind, &str) -> Result<String> + Send + Sync>;

/// Inference service answering from a closure and recording every prompt.
pub(crate) struct ScriptedInference {
    responder: Responder,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedInference {
    pub fn new(
        responder: impl Fn(PromptKind, &str) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Well-formed answers for every operation, with a fixed suitability.
    pub fn answering(suitable: bool) -> Self {
        Self::new(move |kind, _| Ok(canned(kind, suitable)))
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn calls_for(&self, kind: PromptKind) -> usize {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| kind_of(p) == kind)
            .count()
    }

    /// Number of prompts mentioning `needle`.
    pub fn calls_mentioning(&self, needle: &str) -> usize {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.contains(needle))
            .count()
    }
}

pub(crate) fn canned(kind: PromptKind, suitable: bool) -> String {
    match kind {
        PromptKind::Translate => "번역문".into(),
        PromptKind::Metadata => r#"```json
{"overview": "화장품 기획", "business_category": "화장품", "keywords": "코스메", "location": "도쿄", "related_links": ""}
```"#
            .into(),
        PromptKind::Suitability => {
            format!(r#"{{"is_suitable": {suitable}, "reason": "scripted"}}"#)
        }
        PromptKind::Origin => r#"{"label": "foreign", "reason": "JP parent"}"#.into(),
    }
}

#[async_trait]
impl InferenceService for ScriptedInference {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        (self.responder)(kind_of(prompt), prompt)
    }

    fn model(&self) -> &str {
        "scripted-model"
    }
}

// ---------------------------------------------------------------------------
// Record source / ledger
// ---------------------------------------------------------------------------

pub(crate) struct VecSource(pub Vec<Record>);

impl RecordSource for VecSource {
    fn load(&self) -> Result<Vec<Record>> {
        Ok(self.0.clone())
    }
}

pub(crate) fn record(n: usize, title: &str) -> Record {
    Record {
        title: title.into(),
        url: format!("https://prtimes.example.jp/a/{n}"),
        company: format!("株式会社テスト{n}"),
        official_url: format!("https://www.test{n}.example.jp"),
        email: format!("pr@test{n}.example.jp"),
        ..Default::default()
    }
}

/// Ledger wrapper counting full overwrites.
pub(crate) struct CountingLedger<L> {
    pub inner: L,
    pub overwrites: Mutex<Vec<usize>>,
}

impl<L> CountingLedger<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            overwrites: Mutex::new(Vec::new()),
        }
    }

    /// Row count of every overwrite, in order.
    pub fn flushes(&self) -> Vec<usize> {
        self.overwrites.lock().unwrap().clone()
    }
}

impl<L: LedgerStore> LedgerStore for CountingLedger<L> {
    fn load(&self) -> Result<Vec<leadflow_shared::LedgerRow>> {
        self.inner.load()
    }

    fn overwrite(&self, rows: &[leadflow_shared::LedgerRow]) -> Result<()> {
        self.overwrites.lock().unwrap().push(rows.len());
        self.inner.overwrite(rows)
    }

    fn update_cells(&self, row: usize, cells: &[(&str, &str)]) -> Result<()> {
        self.inner.update_cells(row, cells)
    }
}

// ---------------------------------------------------------------------------
// CRM
// ---------------------------------------------------------------------------

/// Per-operation call counters of [`InMemoryCrm`].
#[derive(Debug, Default, Clone)]
pub(crate) struct CrmCalls {
    pub org_creates: usize,
    pub org_updates: usize,
    pub contact_creates: usize,
    pub contact_updates: usize,
    pub entry_creates: usize,
    pub entry_updates: usize,
    pub field_creates: usize,
    pub list_pages: usize,
    /// Domains carried by every organization create, in order.
    pub org_create_domains: Vec<Option<String>>,
}

#[derive(Debug, Default)]
pub(crate) struct CrmState {
    pub organizations: Vec<RemoteOrganization>,
    pub contacts: Vec<RemoteContact>,
    pub entries: HashMap<String, Vec<RemoteListEntry>>,
    pub fields: HashMap<FieldModel, Vec<String>>,
    pub calls: CrmCalls,
    next_id: usize,
}

/// In-memory CRM paging its listings two items at a time.
#[derive(Default)]
pub(crate) struct InMemoryCrm {
    pub state: Mutex<CrmState>,
    /// Domains the remote refuses on organization writes.
    pub rejected_domains: HashSet<String>,
    /// Contact emails whose writes fail with a transport error.
    pub failing_emails: HashSet<String>,
}

const PAGE_SIZE: usize = 2;

fn page_of<T: Clone>(items: &[T], page: u32) -> Page<T> {
    let start = (page as usize - 1) * PAGE_SIZE;
    let slice: Vec<T> = items.iter().skip(start).take(PAGE_SIZE).cloned().collect();
    let next = (start + PAGE_SIZE < items.len()).then_some(page + 1);
    Page { items: slice, next }
}

impl InMemoryCrm {
    pub fn with_organizations(names: &[&str]) -> Self {
        let crm = Self::default();
        {
            let mut state = crm.state.lock().unwrap();
            for name in names {
                let id = state.fresh_id("org");
                state.organizations.push(RemoteOrganization {
                    id,
                    name: (*name).to_string(),
                });
            }
        }
        crm
    }

    pub fn calls(&self) -> CrmCalls {
        self.state.lock().unwrap().calls.clone()
    }

    fn check_domain(&self, draft: &OrganizationDraft) -> Result<()> {
        match &draft.domain {
            Some(domain) if self.rejected_domains.contains(domain) => Err(
                LeadflowError::DomainConflict(format!("{domain} already claimed")),
            ),
            _ => Ok(()),
        }
    }
}

impl CrmState {
    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{}", self.next_id)
    }
}

#[async_trait]
impl CrmApi for InMemoryCrm {
    async fn list_organizations(&self, page: u32) -> Result<Page<RemoteOrganization>> {
        let mut state = self.state.lock().unwrap();
        state.calls.list_pages += 1;
        Ok(page_of(&state.organizations, page))
    }

    async fn list_contacts(&self, page: u32) -> Result<Page<RemoteContact>> {
        let mut state = self.state.lock().unwrap();
        state.calls.list_pages += 1;
        Ok(page_of(&state.contacts, page))
    }

    async fn create_organization(&self, draft: &OrganizationDraft) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.org_creates += 1;
        state.calls.org_create_domains.push(draft.domain.clone());
        self.check_domain(draft)?;
        let id = state.fresh_id("org");
        state.organizations.push(RemoteOrganization {
            id: id.clone(),
            name: draft.name.clone(),
        });
        Ok(id)
    }

    async fn update_organization(&self, _id: &str, draft: &OrganizationDraft) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.org_updates += 1;
        self.check_domain(draft)
    }

    async fn create_contact(&self, draft: &ContactDraft) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.contact_creates += 1;
        if self.failing_emails.contains(&draft.email) {
            return Err(LeadflowError::Transport("HTTP 500 Internal Server Error".into()));
        }
        let id = state.fresh_id("contact");
        state.contacts.push(RemoteContact {
            id: id.clone(),
            email: draft.email.clone(),
        });
        Ok(id)
    }

    async fn update_contact(&self, _id: &str, draft: &ContactDraft) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.contact_updates += 1;
        if self.failing_emails.contains(&draft.email) {
            return Err(LeadflowError::Transport("HTTP 500 Internal Server Error".into()));
        }
        Ok(())
    }

    async fn list_fields(&self, model: &FieldModel) -> Result<Vec<FieldDeclaration>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .fields
            .get(model)
            .into_iter()
            .flatten()
            .map(|name| FieldDeclaration { name: name.clone() })
            .collect())
    }

    async fn create_field(&self, model: &FieldModel, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.field_creates += 1;
        state
            .fields
            .entry(model.clone())
            .or_default()
            .push(name.to_string());
        Ok(())
    }

    async fn list_entries(&self, list_id: &str, page: u32) -> Result<Page<RemoteListEntry>> {
        let mut state = self.state.lock().unwrap();
        state.calls.list_pages += 1;
        let entries = state.entries.get(list_id).cloned().unwrap_or_default();
        Ok(page_of(&entries, page))
    }

    async fn create_entry(&self, list_id: &str, draft: &ListEntryDraft) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.entry_creates += 1;
        let id = state.fresh_id("entry");
        state
            .entries
            .entry(list_id.to_string())
            .or_default()
            .push(RemoteListEntry {
                id: id.clone(),
                entryable_id: draft.organization_id.clone(),
            });
        Ok(id)
    }

    async fn update_entry(
        &self,
        _list_id: &str,
        _entry_id: &str,
        _draft: &ListEntryDraft,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.entry_updates += 1;
        Ok(())
    }
}
