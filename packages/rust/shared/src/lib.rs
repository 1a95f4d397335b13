//! Shared types, error model, and configuration for leadflow.
//!
//! This crate is the foundation depended on by all other leadflow crates.
//! It provides:
//! - [`LeadflowError`], the unified error type
//! - Domain types ([`Record`], [`Verdict`], [`EnrichedRecord`], [`LedgerRow`], [`RunId`])
//! - Configuration ([`AppConfig`], config loading, credential lookup)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrmConfig, FiltersConfig, InferenceConfig, OriginPredicate, PipelineConfig,
    RateLimitConfig, ReconcileConfig, StorageConfig, config_dir, config_file_path,
    inference_api_key, init_config, load_config, load_config_from, require_crm_api_key,
    resolve_api_key,
};
pub use error::{LeadflowError, Result};
pub use types::{
    EnrichedRecord, Judgment, LedgerRow, MetadataInterpretation, NO_CREDENTIAL_RATIONALE, Origin,
    ReconcileStatus, Record, RunId, Suitability, Verdict,
};
