//! Persistence for leadflow.
//!
//! - [`Storage`] wraps a libSQL state database holding the run log and the
//!   response cache for paid inference calls.
//! - [`ledger`] is the tabular result set shared by the enrichment and
//!   reconciliation stages (CSV on disk).
//! - [`source`] reads raw scraped records.
//!
//! **Access rules:**
//! - `enrich` / `reconcile`: read-write (sole writer) via [`Storage::open`]
//! - `runs` listing: read-only via [`Storage::open_readonly`]

pub mod ledger;
mod migrations;
pub mod source;

use std::path::Path;

use chrono::{DateTime, Utc};
use leadflow_shared::{LeadflowError, Result, RunId};
use libsql::{Connection, Database, params};
use uuid::Uuid;

pub use ledger::{CsvLedger, LEDGER_COLUMNS, LedgerStore, STATUS_COLUMN, STATUS_MESSAGE_COLUMN};
pub use source::{CsvRecordSource, RecordSource};

/// Kind of pipeline invocation recorded in the run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Enrich,
    Reconcile,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enrich => "enrich",
            Self::Reconcile => "reconcile",
        }
    }
}

/// One row of the run log.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub kind: String,
    /// Input file or ledger the run worked on.
    pub input_ref: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stats_json: Option<String>,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LeadflowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        LeadflowError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LeadflowError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run log
    // -----------------------------------------------------------------------

    /// Record the start of a run. Returns the generated run ID.
    pub async fn insert_run(&self, kind: RunKind, input_ref: &str) -> Result<RunId> {
        self.check_writable()?;
        let id = RunId::new();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO runs (id, kind, input_ref, started_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), kind.as_str(), input_ref, now.as_str()],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;
        Ok(id)
    }

    /// Mark a run finished and attach its stats.
    pub async fn finish_run(&self, run_id: &RunId, stats_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?1, stats_json = ?2 WHERE id = ?3",
                params![now.as_str(), stats_json, run_id.to_string()],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// List runs, most recent first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, kind, input_ref, started_at, finished_at, stats_json
                 FROM runs ORDER BY started_at DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_run(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Response cache
    // -----------------------------------------------------------------------

    /// Get a cached inference response.
    pub async fn get_cached_response(
        &self,
        task: &str,
        prompt_hash: &str,
        model_id: &str,
    ) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT response FROM response_cache
                 WHERE task = ?1 AND prompt_hash = ?2 AND model_id = ?3",
                params![task, prompt_hash, model_id],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let response: String = row
                    .get(0)
                    .map_err(|e| LeadflowError::Storage(e.to_string()))?;
                Ok(Some(response))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(LeadflowError::Storage(e.to_string())),
        }
    }

    /// Store an inference response in the cache (upserts).
    pub async fn set_cached_response(
        &self,
        task: &str,
        prompt_hash: &str,
        model_id: &str,
        response: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO response_cache (id, task, prompt_hash, model_id, response, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(task, prompt_hash, model_id) DO UPDATE SET
                   response = excluded.response,
                   created_at = excluded.created_at",
                params![id.as_str(), task, prompt_hash, model_id, response, now.as_str()],
            )
            .await
            .map_err(|e| LeadflowError::Storage(e.to_string()))?;
        Ok(())
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LeadflowError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to a [`RunRecord`].
fn row_to_run(row: &libsql::Row) -> Result<RunRecord> {
    let started_at: String = row
        .get(3)
        .map_err(|e| LeadflowError::Storage(e.to_string()))?;
    let finished_at = match row.get::<String>(4).ok() {
        Some(s) => Some(parse_timestamp(&s)?),
        None => None,
    };

    Ok(RunRecord {
        id: row
            .get::<String>(0)
            .map_err(|e| LeadflowError::Storage(e.to_string()))?,
        kind: row
            .get::<String>(1)
            .map_err(|e| LeadflowError::Storage(e.to_string()))?,
        input_ref: row
            .get::<String>(2)
            .map_err(|e| LeadflowError::Storage(e.to_string()))?,
        started_at: parse_timestamp(&started_at)?,
        finished_at,
        stats_json: row.get::<String>(5).ok(),
    })
}
