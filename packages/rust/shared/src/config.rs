//! Application configuration for leadflow.
//!
//! User config lives at `~/.leadflow/leadflow.toml`.
//! CLI flags override config file values, which override defaults.
//! Credentials are never stored in the file; the file only names the
//! environment variables that hold them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LeadflowError, Result};
use crate::types::Origin;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "leadflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".leadflow";

/// File name of the state database inside `storage.state_dir`.
const STATE_DB_NAME: &str = "state.db";

// ---------------------------------------------------------------------------
// Config structs (matching leadflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub crm: CrmConfig,

    #[serde(default)]
    pub filters: FiltersConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Flush the ledger after this many processed records.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    /// Stop when the first N records are all unsuitable. 0 disables.
    #[serde(default = "default_early_stop_after")]
    pub early_stop_after: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            early_stop_after: default_early_stop_after(),
        }
    }
}

fn default_checkpoint_interval() -> usize {
    5
}
fn default_early_stop_after() -> usize {
    10
}

/// `[rate_limit]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Classification calls allowed per window.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Optional budget for translation calls (unthrottled when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation_capacity: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation_window_secs: Option<u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            window_secs: default_window_secs(),
            translation_capacity: None,
            translation_window_secs: None,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Translation budget as `(capacity, window)`, if one is configured.
    pub fn translation_budget(&self) -> Option<(usize, Duration)> {
        self.translation_capacity.map(|capacity| {
            let secs = self.translation_window_secs.unwrap_or(self.window_secs);
            (capacity, Duration::from_secs(secs))
        })
    }
}

fn default_capacity() -> usize {
    15
}
fn default_window_secs() -> u64 {
    60
}

/// `[inference]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_inference_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of an OpenAI-compatible API.
    #[serde(default = "default_inference_base_url")]
    pub base_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Language that titles and metadata are translated into.
    #[serde(default = "default_target_language")]
    pub target_language: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_inference_key_env(),
            model: default_model(),
            base_url: default_inference_base_url(),
            timeout_secs: default_timeout_secs(),
            target_language: default_target_language(),
        }
    }
}

fn default_inference_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_inference_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_target_language() -> String {
    "Korean".into()
}

/// `[crm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmConfig {
    #[serde(default = "default_crm_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_crm_base_url")]
    pub base_url: String,

    /// List that reconciled organizations are added to. No list membership
    /// is written when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_id: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_crm_key_env(),
            base_url: default_crm_base_url(),
            list_id: None,
            timeout_secs: default_timeout_secs(),
            page_size: default_page_size(),
        }
    }
}

fn default_crm_key_env() -> String {
    "RELATE_API_KEY".into()
}
fn default_crm_base_url() -> String {
    "https://api.relate.so/v1".into()
}
fn default_page_size() -> u32 {
    100
}

/// `[filters]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiltersConfig {
    /// Title substrings that disqualify a record without a remote call.
    #[serde(default = "default_negative_keywords")]
    pub negative_keywords: Vec<String>,

    /// Keyword-field substrings that mark a company as domestic.
    #[serde(default = "default_domestic_keywords")]
    pub domestic_keywords: Vec<String>,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            negative_keywords: default_negative_keywords(),
            domestic_keywords: default_domestic_keywords(),
        }
    }
}

fn default_negative_keywords() -> Vec<String> {
    [
        "回収", "お詫び", "訂正", "不適合", "中止", "誤記", "決算", "人事", "株価", "訃報",
        "事件", "事故", "アンケート", "調査", "実施", "共同",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_domestic_keywords() -> Vec<String> {
    [
        "韓国",
        "韓国語",
        "コリア",
        "K-POP",
        "K-ビューティー",
        "Kビューティー",
        "ソウル",
        "アモレパシフィック",
        "LG生活",
        "イニスフリー",
        "サムスン",
        "Korea",
        "Korean",
        "K-beauty",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Origin filter applied before reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OriginPredicate {
    /// Only records classified `foreign`.
    ForeignOnly,
    /// Anything except `domestic` (unknown included).
    NotDomestic,
    /// No origin filter.
    Any,
}

impl OriginPredicate {
    /// Whether a record of `origin` passes this filter.
    pub fn admits(&self, origin: Origin) -> bool {
        match self {
            Self::ForeignOnly => origin == Origin::Foreign,
            Self::NotDomestic => origin != Origin::Domestic,
            Self::Any => true,
        }
    }
}

impl std::str::FromStr for OriginPredicate {
    type Err = LeadflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "foreign-only" => Ok(Self::ForeignOnly),
            "not-domestic" => Ok(Self::NotDomestic),
            "any" => Ok(Self::Any),
            other => Err(LeadflowError::config(format!(
                "unknown origin predicate '{other}': expected foreign-only, not-domestic or any"
            ))),
        }
    }
}

/// `[reconcile]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_origin_predicate")]
    pub origin: OriginPredicate,

    #[serde(default = "default_true")]
    pub require_suitable: bool,

    #[serde(default = "default_true")]
    pub require_email: bool,

    /// Emails containing any of these (case-insensitive) are not usable.
    #[serde(default = "default_blocked_email_fragments")]
    pub blocked_email_fragments: Vec<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            origin: default_origin_predicate(),
            require_suitable: true,
            require_email: true,
            blocked_email_fragments: default_blocked_email_fragments(),
        }
    }
}

fn default_origin_predicate() -> OriginPredicate {
    OriginPredicate::ForeignOnly
}
fn default_true() -> bool {
    true
}
fn default_blocked_email_fragments() -> Vec<String> {
    vec!["wordpress".into()]
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the state database. `~` expands to the home dir.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> String {
    "~/.leadflow".into()
}

impl StorageConfig {
    /// Resolved path of the state database.
    pub fn state_db_path(&self) -> Result<PathBuf> {
        Ok(expand_home(&self.state_dir)?.join(STATE_DB_NAME))
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| LeadflowError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None if path == "~" => dirs::home_dir()
            .ok_or_else(|| LeadflowError::config("could not determine home directory")),
        None => Ok(PathBuf::from(path)),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.leadflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LeadflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.leadflow/leadflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LeadflowError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| LeadflowError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LeadflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LeadflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LeadflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Read a credential from the named env var. Empty values count as missing.
pub fn resolve_api_key(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Some(val),
        _ => None,
    }
}

/// Inference credential, if configured. Its absence is not fatal: the judge
/// then runs offline.
pub fn inference_api_key(config: &AppConfig) -> Option<String> {
    resolve_api_key(&config.inference.api_key_env)
}

/// CRM credential. Reconciliation cannot run without it.
pub fn require_crm_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.crm.api_key_env;
    resolve_api_key(var_name).ok_or_else(|| {
        LeadflowError::config(format!(
            "CRM API key not found. Set the {var_name} environment variable."
        ))
    })
}
