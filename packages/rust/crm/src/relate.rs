//! REST client for a Relate-style CRM API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, instrument};

use leadflow_shared::{CrmConfig, LeadflowError, Result};

use crate::{
    ContactDraft, CrmApi, FieldDeclaration, FieldModel, ListEntryDraft, OrganizationDraft, Page,
    RemoteContact, RemoteListEntry, RemoteOrganization,
};

/// User-Agent string for CRM requests.
const USER_AGENT: &str = concat!("leadflow/", env!("CARGO_PKG_VERSION"));

/// Maximum number of body bytes echoed into transport errors.
const ERROR_BODY_LIMIT: usize = 200;

/// Entity type recorded on list entries.
const ENTRYABLE_TYPE: &str = "Organization";

/// Connection settings for [`RelateClient`].
#[derive(Debug, Clone)]
pub struct RelateOptions {
    pub base_url: String,
    pub timeout_secs: u64,
    pub page_size: u32,
}

impl From<&CrmConfig> for RelateOptions {
    fn from(config: &CrmConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            timeout_secs: config.timeout_secs,
            page_size: config.page_size,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Listing<T> {
    data: Vec<T>,
    #[serde(default)]
    meta: ListingMeta,
}

#[derive(Default, Deserialize)]
struct ListingMeta {
    #[serde(default)]
    next_page: Option<u32>,
}

impl<T> Listing<T> {
    fn into_page<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.data.into_iter().map(f).collect(),
            next: self.meta.next_page,
        }
    }
}

#[derive(Deserialize)]
struct OrganizationItem {
    #[serde(deserialize_with = "de_id")]
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct ContactItem {
    #[serde(deserialize_with = "de_id")]
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct EntryItem {
    #[serde(deserialize_with = "de_id")]
    id: String,
    #[serde(deserialize_with = "de_id")]
    entryable_id: String,
}

#[derive(Deserialize)]
struct FieldItem {
    name: String,
}

#[derive(Deserialize)]
struct Created {
    #[serde(deserialize_with = "de_id")]
    id: String,
}

#[derive(Serialize)]
struct OrganizationBody<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    domains: Option<[&'a str; 1]>,
    custom_fields: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a OrganizationDraft> for OrganizationBody<'a> {
    fn from(draft: &'a OrganizationDraft) -> Self {
        Self {
            name: &draft.name,
            domains: draft.domain.as_deref().map(|d| [d]),
            custom_fields: &draft.fields,
        }
    }
}

#[derive(Serialize)]
struct ContactBody<'a> {
    email: &'a str,
    organization_ids: [&'a str; 1],
    custom_fields: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a ContactDraft> for ContactBody<'a> {
    fn from(draft: &'a ContactDraft) -> Self {
        Self {
            email: &draft.email,
            organization_ids: [&draft.organization_id],
            custom_fields: &draft.fields,
        }
    }
}

#[derive(Serialize)]
struct NewEntryBody<'a> {
    entryable_id: &'a str,
    entryable_type: &'static str,
    list_fields: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct EntryUpdateBody<'a> {
    list_fields: &'a BTreeMap<String, String>,
}

/// Ids come back as strings or integers depending on the endpoint.
fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or integer id, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Bearer-token JSON client for the CRM.
pub struct RelateClient {
    client: Client,
    base_url: String,
    api_key: String,
    page_size: u32,
}

impl RelateClient {
    pub fn new(api_key: impl Into<String>, opts: RelateOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(opts.timeout_secs))
            .build()
            .map_err(|e| LeadflowError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: opts.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            page_size: opts.page_size,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(&self.api_key)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(&self.api_key)
    }

    fn patch(&self, path: &str) -> RequestBuilder {
        self.client.patch(self.url(path)).bearer_auth(&self.api_key)
    }

    fn paged(&self, path: &str, page: u32) -> RequestBuilder {
        self.get(path)
            .query(&[("page", page), ("per_page", self.page_size)])
    }

    /// Send a request and return its status and body text.
    async fn send(&self, request: RequestBuilder) -> Result<(StatusCode, String)> {
        let response = request
            .send()
            .await
            .map_err(|e| LeadflowError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LeadflowError::Transport(format!("failed to read body: {e}")))?;
        Ok((status, body))
    }

    /// Send a request, failing on any non-2xx status.
    async fn send_ok(&self, request: RequestBuilder) -> Result<String> {
        let (status, body) = self.send(request).await?;
        ensure_success(status, &body)?;
        Ok(body)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let body = self.send_ok(request).await?;
        decode(&body)
    }

    /// Organization writes classify a 422 on a domain-carrying payload as a
    /// domain conflict.
    async fn send_organization(
        &self,
        request: RequestBuilder,
        draft: &OrganizationDraft,
    ) -> Result<String> {
        let (status, body) = self.send(request).await?;
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            if let Some(domain) = &draft.domain {
                return Err(LeadflowError::DomainConflict(format!(
                    "{domain}: {}",
                    truncate(&body, ERROR_BODY_LIMIT)
                )));
            }
        }
        ensure_success(status, &body)?;
        Ok(body)
    }
}

fn ensure_success(status: StatusCode, body: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    Err(LeadflowError::Transport(format!(
        "HTTP {status}: {}",
        truncate(body, ERROR_BODY_LIMIT)
    )))
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| LeadflowError::parse(format!("CRM response: {e}")))
}

/// Cut `s` to at most `max` bytes on a char boundary.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn model_key(model: &FieldModel) -> &'static str {
    match model {
        FieldModel::Organization => "organization",
        FieldModel::Contact => "contact",
        FieldModel::List(_) => "list",
    }
}

fn fields_path(model: &FieldModel) -> String {
    match model {
        FieldModel::List(id) => format!("/lists/{id}/fields"),
        _ => format!("/custom_fields?model={}", model_key(model)),
    }
}

#[async_trait]
impl CrmApi for RelateClient {
    #[instrument(skip(self))]
    async fn list_organizations(&self, page: u32) -> Result<Page<RemoteOrganization>> {
        let listing: Listing<OrganizationItem> =
            self.fetch(self.paged("/organizations", page)).await?;
        debug!(count = listing.data.len(), "organizations page");
        Ok(listing.into_page(|o| RemoteOrganization {
            id: o.id,
            name: o.name.unwrap_or_default(),
        }))
    }

    #[instrument(skip(self))]
    async fn list_contacts(&self, page: u32) -> Result<Page<RemoteContact>> {
        let listing: Listing<ContactItem> = self.fetch(self.paged("/contacts", page)).await?;
        debug!(count = listing.data.len(), "contacts page");
        Ok(listing.into_page(|c| RemoteContact {
            id: c.id,
            email: c.email.unwrap_or_default(),
        }))
    }

    #[instrument(skip_all, fields(name = %draft.name, domain = ?draft.domain))]
    async fn create_organization(&self, draft: &OrganizationDraft) -> Result<String> {
        let request = self
            .post("/organizations")
            .json(&OrganizationBody::from(draft));
        let body = self.send_organization(request, draft).await?;
        Ok(decode::<Created>(&body)?.id)
    }

    #[instrument(skip(self, draft), fields(name = %draft.name))]
    async fn update_organization(&self, id: &str, draft: &OrganizationDraft) -> Result<()> {
        let request = self
            .patch(&format!("/organizations/{id}"))
            .json(&OrganizationBody::from(draft));
        self.send_organization(request, draft).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(email = %draft.email))]
    async fn create_contact(&self, draft: &ContactDraft) -> Result<String> {
        let created: Created = self
            .fetch(self.post("/contacts").json(&ContactBody::from(draft)))
            .await?;
        Ok(created.id)
    }

    #[instrument(skip(self, draft), fields(email = %draft.email))]
    async fn update_contact(&self, id: &str, draft: &ContactDraft) -> Result<()> {
        self.send_ok(
            self.patch(&format!("/contacts/{id}"))
                .json(&ContactBody::from(draft)),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_fields(&self, model: &FieldModel) -> Result<Vec<FieldDeclaration>> {
        let listing: Listing<FieldItem> = self.fetch(self.get(&fields_path(model))).await?;
        Ok(listing
            .data
            .into_iter()
            .map(|f| FieldDeclaration { name: f.name })
            .collect())
    }

    #[instrument(skip(self))]
    async fn create_field(&self, model: &FieldModel, name: &str) -> Result<()> {
        let request = match model {
            FieldModel::List(id) => self
                .post(&format!("/lists/{id}/fields"))
                .json(&serde_json::json!({"name": name, "field_type": "text"})),
            FieldModel::Organization | FieldModel::Contact => {
                self.post("/custom_fields").json(&serde_json::json!({
                    "model": model_key(model),
                    "name": name,
                    "field_type": "text",
                }))
            }
        };
        self.send_ok(request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_entries(&self, list_id: &str, page: u32) -> Result<Page<RemoteListEntry>> {
        let listing: Listing<EntryItem> = self
            .fetch(self.paged(&format!("/lists/{list_id}/entries"), page))
            .await?;
        Ok(listing.into_page(|e| RemoteListEntry {
            id: e.id,
            entryable_id: e.entryable_id,
        }))
    }

    #[instrument(skip(self, draft), fields(organization_id = %draft.organization_id))]
    async fn create_entry(&self, list_id: &str, draft: &ListEntryDraft) -> Result<String> {
        let body = NewEntryBody {
            entryable_id: &draft.organization_id,
            entryable_type: ENTRYABLE_TYPE,
            list_fields: &draft.fields,
        };
        let created: Created = self
            .fetch(self.post(&format!("/lists/{list_id}/entries")).json(&body))
            .await?;
        Ok(created.id)
    }

    #[instrument(skip(self, draft))]
    async fn update_entry(
        &self,
        list_id: &str,
        entry_id: &str,
        draft: &ListEntryDraft,
    ) -> Result<()> {
        let body = EntryUpdateBody {
            list_fields: &draft.fields,
        };
        self.send_ok(
            self.patch(&format!("/lists/{list_id}/entries/{entry_id}"))
                .json(&body),
        )
        .await?;
        Ok(())
    }
}
