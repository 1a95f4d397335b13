//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use leadflow_core::{
    Eligibility, EnrichmentJudge, FilterCascade, LogNotifier, Notifier, ProcessProgress,
    Processor, ProcessorConfig, RateGovernor, ReconcileProgress, Reconciler, RemoteJudge,
    RunSummary,
};
use leadflow_crm::{CrmApi, RelateClient, RelateOptions};
use leadflow_inference::{InferenceService, OpenAiClient, OpenAiOptions};
use leadflow_shared::{
    AppConfig, OriginPredicate, ReconcileStatus, Suitability, inference_api_key, init_config,
    load_config, load_config_from, require_crm_api_key,
};
use leadflow_storage::{CsvLedger, CsvRecordSource, RunKind, Storage};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// leadflow: enrich press-release leads and sync them into the CRM.
#[derive(Parser)]
#[command(
    name = "leadflow",
    version,
    about = "Classify and translate scraped leads, then reconcile them into the CRM.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.leadflow/leadflow.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Filter, classify and translate a raw CSV into the ledger.
    Enrich {
        /// Raw records CSV (e.g. raw_2026-10-18.csv).
        raw_csv: PathBuf,

        /// Ledger to write (defaults to final_<date>.csv next to the input).
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Flush the ledger every K records.
        #[arg(long, value_name = "K")]
        checkpoint_every: Option<usize>,

        /// Stop when the first M records are all unsuitable.
        #[arg(long, value_name = "M", conflicts_with = "no_early_stop")]
        early_stop: Option<usize>,

        /// Never stop early.
        #[arg(long)]
        no_early_stop: bool,
    },

    /// Upsert eligible ledger rows into the CRM.
    Reconcile {
        /// Ledger CSV produced by `enrich`.
        ledger: PathBuf,

        /// Origin filter: foreign-only, not-domestic or any.
        #[arg(long)]
        origin: Option<OriginPredicate>,
    },

    /// List recorded runs.
    Runs {
        /// Maximum number of runs to show.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "leadflow=info",
        1 => "leadflow=debug",
        _ => "leadflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Enrich {
            raw_csv,
            ledger,
            checkpoint_every,
            early_stop,
            no_early_stop,
        } => {
            let config = resolve_config(config_path)?;
            let mut processor_config = ProcessorConfig::from(&config.pipeline);
            if let Some(k) = checkpoint_every {
                processor_config.checkpoint_interval = k.max(1);
            }
            if let Some(m) = early_stop {
                processor_config.early_stop = (m > 0).then_some(m);
            }
            if no_early_stop {
                processor_config.early_stop = None;
            }
            cmd_enrich(&config, &raw_csv, ledger, processor_config).await
        }
        Command::Reconcile { ledger, origin } => {
            let mut config = resolve_config(config_path)?;
            if let Some(origin) = origin {
                config.reconcile.origin = origin;
            }
            cmd_reconcile(&config, &ledger).await
        }
        Command::Runs { limit } => cmd_runs(&resolve_config(config_path)?, limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current record");
            token.cancel();
        }
    });
}

// ---------------------------------------------------------------------------
// enrich
// ---------------------------------------------------------------------------

static RAW_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^raw_(\d{4}-\d{2}-\d{2})\.csv$").expect("valid regex"));

/// `final_<date>.csv` next to the raw input.
fn default_ledger_path(raw_csv: &Path) -> PathBuf {
    let date = raw_csv
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| RAW_DATE.captures(n))
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d").to_string());
    raw_csv.with_file_name(format!("final_{date}.csv"))
}

fn build_judge(config: &AppConfig, storage: Arc<Storage>) -> Result<RemoteJudge> {
    let service: Option<Arc<dyn InferenceService>> = match inference_api_key(config) {
        Some(key) => Some(Arc::new(OpenAiClient::new(
            key,
            OpenAiOptions::from(&config.inference),
        )?)),
        None => {
            warn!(
                env = %config.inference.api_key_env,
                "inference API key not set, records will be left undetermined"
            );
            None
        }
    };

    let governor = Arc::new(RateGovernor::new(
        config.rate_limit.capacity,
        config.rate_limit.window(),
    )?);
    let mut judge = RemoteJudge::new(service, governor)
        .with_cache(storage)
        .with_target_language(config.inference.target_language.clone());
    if let Some((capacity, window)) = config.rate_limit.translation_budget() {
        judge = judge.with_translation_governor(Arc::new(RateGovernor::new(capacity, window)?));
    }
    Ok(judge)
}

async fn cmd_enrich(
    config: &AppConfig,
    raw_csv: &Path,
    ledger: Option<PathBuf>,
    processor_config: ProcessorConfig,
) -> Result<()> {
    if !raw_csv.exists() {
        return Err(eyre!("raw CSV not found at '{}'", raw_csv.display()));
    }
    let ledger_path = ledger.unwrap_or_else(|| default_ledger_path(raw_csv));

    let storage = Arc::new(Storage::open(&config.storage.state_db_path()?).await?);
    let judge: Arc<dyn EnrichmentJudge> = Arc::new(build_judge(config, storage.clone())?);
    let processor = Processor::new(
        judge,
        FilterCascade::from_config(&config.filters),
        processor_config,
    );

    let run_id = storage
        .insert_run(RunKind::Enrich, &raw_csv.display().to_string())
        .await?;
    info!(
        %run_id,
        input = %raw_csv.display(),
        ledger = %ledger_path.display(),
        checkpoint_interval = processor_config.checkpoint_interval,
        early_stop = ?processor_config.early_stop,
        "starting enrichment"
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let source = CsvRecordSource::new(raw_csv);
    let store = CsvLedger::new(&ledger_path);
    let progress = CliProgress::new();
    let result = processor.run(&source, &store, &cancel, &progress).await;
    progress.finish();
    let report = result?;

    storage
        .finish_run(&run_id, &serde_json::to_string(&report)?)
        .await?;
    LogNotifier.notify(&RunSummary::from_report(
        run_id.clone(),
        &report,
        ledger_path.clone(),
    ));

    println!();
    println!("  Enrichment {}", report.outcome.as_str());
    println!("  Run:          {run_id}");
    println!("  Records:      {}", report.total);
    println!("  Resumed:      {}", report.resumed);
    println!("  Processed:    {}", report.processed);
    println!("  Filtered:     {}", report.rejected_locally);
    println!("  Suitable:     {}", report.suitable);
    println!("  Undetermined: {}", report.undetermined);
    println!("  Ledger:       {}", ledger_path.display());
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// reconcile
// ---------------------------------------------------------------------------

async fn cmd_reconcile(config: &AppConfig, ledger_path: &Path) -> Result<()> {
    if !ledger_path.exists() {
        return Err(eyre!("ledger not found at '{}'", ledger_path.display()));
    }
    let api_key = require_crm_api_key(config)?;
    let crm: Arc<dyn CrmApi> = Arc::new(RelateClient::new(
        api_key,
        RelateOptions::from(&config.crm),
    )?);
    if config.crm.list_id.is_none() {
        info!("no crm.list_id configured, list membership is skipped");
    }

    let storage = Storage::open(&config.storage.state_db_path()?).await?;
    let run_id = storage
        .insert_run(RunKind::Reconcile, &ledger_path.display().to_string())
        .await?;
    info!(%run_id, ledger = %ledger_path.display(), origin = ?config.reconcile.origin, "starting reconciliation");

    let reconciler = Reconciler::new(
        crm,
        Eligibility::from(&config.reconcile),
        config.crm.list_id.clone(),
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let store = CsvLedger::new(ledger_path);
    let progress = CliProgress::new();
    let result = reconciler.run(&store, &cancel, &progress).await;
    progress.finish();
    let report = result?;

    storage
        .finish_run(&run_id, &serde_json::to_string(&report)?)
        .await?;

    println!();
    println!(
        "  Reconciliation {}",
        if report.cancelled { "cancelled" } else { "complete" }
    );
    println!("  Run:        {run_id}");
    println!("  Rows:       {}", report.rows);
    println!("  Flagged:    {}", report.already_flagged);
    println!("  Ineligible: {}", report.ineligible);
    println!("  Succeeded:  {}", report.succeeded);
    println!("  Failed:     {}", report.failed);
    println!(
        "  Created:    {} organizations, {} contacts, {} list entries",
        report.organizations_created, report.contacts_created, report.entries_created
    );
    if report.status_write_failures > 0 {
        println!(
            "  Warning:    {} statuses could not be written back",
            report.status_write_failures
        );
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProcessProgress for CliProgress {
    fn resumed(&self, rows: usize) {
        self.spinner
            .set_message(format!("Resumed {rows} rows from existing ledger"));
    }

    fn record_done(&self, url: &str, current: usize, total: usize, suitability: Suitability) {
        self.spinner.set_message(format!(
            "Enriching [{current}/{total}] {} {url}",
            suitability.as_str()
        ));
    }

    fn checkpoint(&self, rows: usize) {
        self.spinner.println(format!("  checkpoint: {rows} rows saved"));
    }
}

impl ReconcileProgress for CliProgress {
    fn record_done(&self, current: usize, total: usize, status: &ReconcileStatus) {
        self.spinner.set_message(format!(
            "Reconciling [{current}/{total}] {}",
            status.status_cell()
        ));
    }
}

// ---------------------------------------------------------------------------
// runs / config
// ---------------------------------------------------------------------------

async fn cmd_runs(config: &AppConfig, limit: u32) -> Result<()> {
    let db_path = config.storage.state_db_path()?;
    if !db_path.exists() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    let storage = Storage::open_readonly(&db_path).await?;
    let runs = storage.list_runs(limit).await?;
    if runs.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    for run in runs {
        let finished = run
            .finished_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unfinished".to_string());
        println!(
            "{}  {:<9}  {}  {}  {}",
            run.id,
            run.kind,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            finished,
            run.input_ref
        );
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
