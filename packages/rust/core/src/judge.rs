//! Enrichment judge: translation and classification through the remote
//! inference service.
//!
//! Every operation degrades instead of failing: a transport or parse error
//! becomes an `undetermined`/`unknown` label carrying the error text, or an
//! empty translation. Nothing here aborts a run.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use leadflow_inference::InferenceService;
use leadflow_shared::{
    Judgment, LeadflowError, MetadataInterpretation, NO_CREDENTIAL_RATIONALE, Origin, Record,
    Result, Suitability,
};
use leadflow_storage::Storage;

use crate::governor::RateGovernor;
use crate::prompts;

/// Injectable classification strategy used by the processor.
#[async_trait]
pub trait EnrichmentJudge: Send + Sync {
    /// Translate native-language text. Empty on failure.
    async fn translate(&self, text: &str) -> String;

    /// Interpret the record's free-text metadata fields. Empty fields on failure.
    async fn interpret_metadata(&self, record: &Record) -> MetadataInterpretation;

    async fn judge_suitability(&self, title: &str, translated_title: &str)
    -> Judgment<Suitability>;

    async fn judge_origin(
        &self,
        company: &str,
        address: &str,
        url: &str,
        keywords: &str,
    ) -> Judgment<Origin>;
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Remote task kinds, used as response-cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Translate,
    InterpretMetadata,
    JudgeSuitability,
    JudgeOrigin,
}

impl Task {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Translate => "translate",
            Self::InterpretMetadata => "interpret_metadata",
            Self::JudgeSuitability => "judge_suitability",
            Self::JudgeOrigin => "judge_origin",
        }
    }

    /// Translation-class tasks bypass the classification budget.
    fn is_translation(&self) -> bool {
        matches!(self, Self::Translate | Self::InterpretMetadata)
    }
}

// ---------------------------------------------------------------------------
// Response normalization
// ---------------------------------------------------------------------------

/// Remove Markdown code fences (```` ```json ```` / ```` ``` ````) around a
/// structured reply.
pub fn strip_fences(raw: &str) -> &str {
    static FENCED_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)^\s*```[A-Za-z]*\s*(.*?)\s*```\s*$").expect("valid regex")
    });
    match FENCED_RE.captures(raw).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw.trim(),
    }
}

#[derive(Deserialize)]
struct SuitabilityReply {
    #[serde(default)]
    is_suitable: serde_json::Value,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct OriginReply {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct MetadataReply {
    #[serde(default)]
    overview: Option<String>,
    #[serde(default)]
    business_category: Option<String>,
    #[serde(default)]
    keywords: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    related_links: Option<String>,
}

fn decode<'a, T: Deserialize<'a>>(raw: &'a str) -> Result<T> {
    serde_json::from_str(strip_fences(raw))
        .map_err(|e| LeadflowError::parse(format!("judge reply: {e}")))
}

fn parse_suitability(raw: &str) -> Result<Judgment<Suitability>> {
    let reply: SuitabilityReply = decode(raw)?;
    let label = match &reply.is_suitable {
        serde_json::Value::Bool(true) => Suitability::Suitable,
        serde_json::Value::Bool(false) => Suitability::Unsuitable,
        serde_json::Value::String(s) if s.eq_ignore_ascii_case("true") => Suitability::Suitable,
        serde_json::Value::String(s) if s.eq_ignore_ascii_case("false") => {
            Suitability::Unsuitable
        }
        other => {
            return Err(LeadflowError::parse(format!(
                "is_suitable is not a boolean: {other}"
            )));
        }
    };
    Ok(Judgment::new(label, clean(reply.reason)))
}

fn parse_origin(raw: &str) -> Result<Judgment<Origin>> {
    let reply: OriginReply = decode(raw)?;
    let label = Origin::from_cell(reply.label.as_deref().unwrap_or_default());
    Ok(Judgment::new(label, clean(reply.reason)))
}

fn parse_metadata(raw: &str) -> Result<MetadataInterpretation> {
    let reply: MetadataReply = decode(raw)?;
    Ok(MetadataInterpretation {
        overview: clean(reply.overview),
        business_category: clean(reply.business_category),
        keywords: clean(reply.keywords),
        location: clean(reply.location),
        related_links: clean(reply.related_links),
    })
}

fn parse_translation(raw: &str) -> Result<String> {
    Ok(raw.trim().to_string())
}

fn clean(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}

fn prompt_hash(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// RemoteJudge
// ---------------------------------------------------------------------------

/// Judge backed by a remote inference service.
///
/// Classification calls pass through the shared [`RateGovernor`];
/// translation-class calls only do when a translation governor is set.
/// With a response cache attached, a cache hit costs neither budget nor a
/// remote call.
pub struct RemoteJudge {
    service: Option<Arc<dyn InferenceService>>,
    governor: Arc<RateGovernor>,
    translation_governor: Option<Arc<RateGovernor>>,
    cache: Option<Arc<Storage>>,
    target_language: String,
}

impl RemoteJudge {
    /// `service` is `None` when no inference credential is configured.
    pub fn new(service: Option<Arc<dyn InferenceService>>, governor: Arc<RateGovernor>) -> Self {
        Self {
            service,
            governor,
            translation_governor: None,
            cache: None,
            target_language: "Korean".into(),
        }
    }

    pub fn with_translation_governor(mut self, governor: Arc<RateGovernor>) -> Self {
        self.translation_governor = Some(governor);
        self
    }

    pub fn with_cache(mut self, storage: Arc<Storage>) -> Self {
        self.cache = Some(storage);
        self
    }

    pub fn with_target_language(mut self, language: impl Into<String>) -> Self {
        self.target_language = language.into();
        self
    }

    pub fn is_offline(&self) -> bool {
        self.service.is_none()
    }

    /// Issue one remote call for `task`, consulting the cache first.
    ///
    /// A raw reply is cached only once `parse` has accepted it.
    async fn call<T>(
        &self,
        service: &dyn InferenceService,
        task: Task,
        prompt: &str,
        parse: fn(&str) -> Result<T>,
    ) -> Result<T> {
        let hash = prompt_hash(prompt);

        if let Some(cache) = &self.cache {
            match cache
                .get_cached_response(task.as_str(), &hash, service.model())
                .await
            {
                Ok(Some(raw)) => match parse(&raw) {
                    Ok(value) => {
                        debug!(task = task.as_str(), "response cache hit");
                        return Ok(value);
                    }
                    Err(e) => warn!(task = task.as_str(), error = %e, "ignoring unparseable cached response"),
                },
                Ok(None) => {}
                Err(e) => warn!(task = task.as_str(), error = %e, "response cache read failed"),
            }
        }

        if task.is_translation() {
            if let Some(governor) = &self.translation_governor {
                governor.acquire().await;
            }
        } else {
            self.governor.acquire().await;
        }

        let raw = service.complete(prompt).await?;
        let value = parse(&raw)?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache
                .set_cached_response(task.as_str(), &hash, service.model(), &raw)
                .await
            {
                warn!(task = task.as_str(), error = %e, "response cache write failed");
            }
        }

        Ok(value)
    }
}

#[async_trait]
impl EnrichmentJudge for RemoteJudge {
    #[instrument(skip_all, fields(len = text.len()))]
    async fn translate(&self, text: &str) -> String {
        let Some(service) = self.service.as_deref() else {
            return String::new();
        };
        if text.trim().is_empty() {
            return String::new();
        }

        let prompt = prompts::translate(text, &self.target_language);
        match self
            .call(service, Task::Translate, &prompt, parse_translation)
            .await
        {
            Ok(translated) => translated,
            Err(e) => {
                warn!(error = %e, "translation failed");
                String::new()
            }
        }
    }

    #[instrument(skip_all, fields(url = %record.url))]
    async fn interpret_metadata(&self, record: &Record) -> MetadataInterpretation {
        let Some(service) = self.service.as_deref() else {
            return MetadataInterpretation::default();
        };
        let has_input = [
            &record.overview,
            &record.business_category,
            &record.keywords,
            &record.location,
            &record.related_links,
        ]
        .iter()
        .any(|f| !f.trim().is_empty());
        if !has_input {
            return MetadataInterpretation::default();
        }

        let prompt = prompts::interpret_metadata(record, &self.target_language);
        match self
            .call(service, Task::InterpretMetadata, &prompt, parse_metadata)
            .await
        {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(error = %e, "metadata interpretation failed");
                MetadataInterpretation::default()
            }
        }
    }

    #[instrument(skip_all)]
    async fn judge_suitability(
        &self,
        title: &str,
        translated_title: &str,
    ) -> Judgment<Suitability> {
        let Some(service) = self.service.as_deref() else {
            return Judgment::new(Suitability::Undetermined, NO_CREDENTIAL_RATIONALE);
        };
        if title.trim().is_empty() {
            return Judgment::new(Suitability::Undetermined, "");
        }

        let prompt = prompts::suitability(title, translated_title);
        match self
            .call(service, Task::JudgeSuitability, &prompt, parse_suitability)
            .await
        {
            Ok(judgment) => judgment,
            Err(e) => {
                warn!(error = %e, "suitability judgment failed");
                Judgment::new(Suitability::Undetermined, format!("inference failed: {e}"))
            }
        }
    }

    #[instrument(skip_all, fields(company = %company))]
    async fn judge_origin(
        &self,
        company: &str,
        address: &str,
        url: &str,
        keywords: &str,
    ) -> Judgment<Origin> {
        let Some(service) = self.service.as_deref() else {
            return Judgment::new(Origin::Unknown, NO_CREDENTIAL_RATIONALE);
        };
        if [company, address, url, keywords]
            .iter()
            .all(|f| f.trim().is_empty())
        {
            return Judgment::new(Origin::Unknown, "");
        }

        let prompt = prompts::origin(company, address, url, keywords);
        match self
            .call(service, Task::JudgeOrigin, &prompt, parse_origin)
            .await
        {
            Ok(judgment) => judgment,
            Err(e) => {
                warn!(error = %e, "origin judgment failed");
                Judgment::new(Origin::Unknown, format!("inference failed: {e}"))
            }
        }
    }
}
