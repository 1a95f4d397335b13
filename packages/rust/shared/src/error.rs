//! Error types for leadflow.
//!
//! Library crates use [`LeadflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all leadflow operations.
#[derive(Debug, thiserror::Error)]
pub enum LeadflowError {
    /// Missing credential or invalid configuration. Fatal at startup.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP failure on a remote call.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed structured response or input cell.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// The remote CRM rejected a supplied organization domain.
    #[error("domain rejected: {0}")]
    DomainConflict(String),

    /// Per-record failure surfaced during reconciliation.
    #[error("record error: {0}")]
    Record(String),

    /// State database or ledger error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (missing required field, bad value, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LeadflowError>;

impl LeadflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error only affects the current remote call or record.
    ///
    /// Configuration errors are the only class that halts a run.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config { .. })
    }
}
