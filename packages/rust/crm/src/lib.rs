//! Remote CRM boundary.
//!
//! Entities are identified remotely by opaque ids; the reconciliation engine
//! maps natural keys (organization name, contact email) onto them. All
//! operations are plain request/response.

mod relate;

use std::collections::BTreeMap;
use std::future::Future;

use async_trait::async_trait;
use leadflow_shared::Result;

pub use relate::{RelateClient, RelateOptions};

// ---------------------------------------------------------------------------
// Remote entities
// ---------------------------------------------------------------------------

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Next page number, `None` on the last page.
    pub next: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOrganization {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteContact {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteListEntry {
    pub id: String,
    /// Id of the organization the entry points at.
    pub entryable_id: String,
}

/// A declared custom field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDeclaration {
    pub name: String,
}

/// Remote model that carries custom fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldModel {
    Organization,
    Contact,
    /// Fields of one list, by list id.
    List(String),
}

impl std::fmt::Display for FieldModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Organization => f.write_str("organization"),
            Self::Contact => f.write_str("contact"),
            Self::List(id) => write!(f, "list {id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Write payloads
// ---------------------------------------------------------------------------

/// Organization create/update payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrganizationDraft {
    pub name: String,
    /// Primary web domain. Omitted from the request when `None`.
    pub domain: Option<String>,
    pub fields: BTreeMap<String, String>,
}

impl OrganizationDraft {
    /// Same payload without the domain.
    pub fn without_domain(&self) -> Self {
        Self {
            domain: None,
            ..self.clone()
        }
    }
}

/// Contact create/update payload, linked to one organization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactDraft {
    pub email: String,
    pub organization_id: String,
    pub fields: BTreeMap<String, String>,
}

/// List entry payload for an organization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListEntryDraft {
    pub organization_id: String,
    pub fields: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Boundary trait
// ---------------------------------------------------------------------------

/// Operations the reconciliation engine needs from the remote CRM.
///
/// Organization writes that carried a domain and were rejected because of it
/// must fail with [`LeadflowError::DomainConflict`](leadflow_shared::LeadflowError::DomainConflict).
#[async_trait]
pub trait CrmApi: Send + Sync {
    async fn list_organizations(&self, page: u32) -> Result<Page<RemoteOrganization>>;
    async fn list_contacts(&self, page: u32) -> Result<Page<RemoteContact>>;

    /// Create an organization, returning its id.
    async fn create_organization(&self, draft: &OrganizationDraft) -> Result<String>;
    async fn update_organization(&self, id: &str, draft: &OrganizationDraft) -> Result<()>;

    /// Create a contact, returning its id.
    async fn create_contact(&self, draft: &ContactDraft) -> Result<String>;
    async fn update_contact(&self, id: &str, draft: &ContactDraft) -> Result<()>;

    async fn list_fields(&self, model: &FieldModel) -> Result<Vec<FieldDeclaration>>;
    async fn create_field(&self, model: &FieldModel, name: &str) -> Result<()>;

    async fn list_entries(&self, list_id: &str, page: u32) -> Result<Page<RemoteListEntry>>;
    /// Create a list entry, returning its id.
    async fn create_entry(&self, list_id: &str, draft: &ListEntryDraft) -> Result<String>;
    async fn update_entry(&self, list_id: &str, entry_id: &str, draft: &ListEntryDraft)
    -> Result<()>;
}

/// First page number of every listing.
pub const FIRST_PAGE: u32 = 1;

/// Drain a paginated listing, starting at [`FIRST_PAGE`].
///
/// Stops when the remote reports no next page, or when the reported next page
/// does not advance.
pub async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut page = FIRST_PAGE;
    loop {
        let batch = fetch(page).await?;
        items.extend(batch.items);
        match batch.next {
            Some(next) if next > page => page = next,
            _ => break,
        }
    }
    Ok(items)
}
