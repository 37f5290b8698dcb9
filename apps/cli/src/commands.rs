//! CLI command definitions, routing, and tracing setup.

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use paperflow_core::{
    Orchestrator, ProgressReporter, RunContext, RunOptions, RunReport, build_pipeline,
    load_corpus,
};
use paperflow_shared::{
    AppConfig, expand_home, init_config, load_config, load_config_from, validate_config,
};
use paperflow_storage::StateLayout;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Paperflow: incremental, checkpointed enrichment for paper corpora.
#[derive(Parser)]
#[command(
    name = "paperflow",
    version,
    about = "Validate, enrich, score and embed academic papers incrementally.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.paperflow/paperflow.toml).
    #[arg(long, global = true, env = "PAPERFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// State directory (overrides `defaults.state_dir`).
    #[arg(long, global = true, env = "PAPERFLOW_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

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
    /// Process every pending record of a corpus.
    Run {
        /// JSONL corpus, one record per line.
        #[arg(long)]
        corpus: PathBuf,

        /// Reprocess the whole corpus (cached stage results are still used).
        #[arg(long)]
        force: bool,

        /// Reprocess this record (repeatable).
        #[arg(long = "record", value_name = "RECORD_ID")]
        records: Vec<String>,

        /// Reprocess records whose last logged failure was not resolved by a later run.
        #[arg(long)]
        retry_failed: bool,

        /// Ignore cached results of this stage (repeatable).
        #[arg(long = "refresh-stage", value_name = "STAGE")]
        refresh_stages: Vec<String>,

        /// Records per manifest commit.
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Show manifest, checkpoint and record store status.
    Status,

    /// List logged failures.
    Failures {
        /// Only this stage.
        #[arg(long)]
        stage: Option<String>,

        /// Show at most this many (most recent last).
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Print a stored record.
    Show {
        /// Record ID.
        record_id: String,
    },

    /// Cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Entry counts and sizes per stage.
    Stats,
    /// Delete cached results.
    Clear {
        /// Only this stage.
        #[arg(long)]
        stage: Option<String>,
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
        0 => "paperflow=info",
        1 => "paperflow=debug",
        _ => "paperflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let env = Env {
        config: cli.config,
        state_dir: cli.state_dir,
    };
    match cli.command {
        Command::Run {
            corpus,
            force,
            records,
            retry_failed,
            refresh_stages,
            chunk_size,
        } => {
            let request = RunRequest {
                corpus,
                force,
                records,
                retry_failed,
                refresh_stages,
                chunk_size,
            };
            cmd_run(&env, request).await
        }
        Command::Status => cmd_status(&env).await,
        Command::Failures { stage, limit } => cmd_failures(&env, stage.as_deref(), limit),
        Command::Show { record_id } => cmd_show(&env, &record_id).await,
        Command::Cache { action } => match action {
            CacheAction::Stats => cmd_cache_stats(&env),
            CacheAction::Clear { stage } => cmd_cache_clear(&env, stage.as_deref()),
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&env).await,
        },
    }
}

/// Global options shared by every command.
struct Env {
    config: Option<PathBuf>,
    state_dir: Option<PathBuf>,
}

impl Env {
    fn load_config(&self) -> Result<AppConfig> {
        let config = match &self.config {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        };
        Ok(config)
    }

    fn state_dir(&self, config: &AppConfig) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(expand_home(&config.defaults.state_dir)?),
        }
    }

    fn layout(&self) -> Result<StateLayout> {
        let config = self.load_config()?;
        Ok(StateLayout::new(self.state_dir(&config)?))
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunRequest {
    corpus: PathBuf,
    force: bool,
    records: Vec<String>,
    retry_failed: bool,
    refresh_stages: Vec<String>,
    chunk_size: Option<usize>,
}

async fn cmd_run(env: &Env, request: RunRequest) -> Result<()> {
    let config = env.load_config()?;
    let pipeline = build_pipeline(&config)?;
    let state_dir = env.state_dir(&config)?;

    for stage in &request.refresh_stages {
        if !pipeline
            .stages()
            .iter()
            .any(|s| s.descriptor().name == *stage)
        {
            return Err(eyre!("--refresh-stage: '{stage}' is not in the pipeline"));
        }
    }

    let mut force_ids: BTreeSet<String> = request.records.into_iter().collect();
    if request.retry_failed {
        let failed = StateLayout::new(&state_dir).outstanding_failures().await?;
        info!(count = failed.len(), "retrying outstanding failures");
        force_ids.extend(failed);
    }

    let mut options = RunOptions::from_config(&config);
    options.force = request.force;
    options.force_ids = force_ids;
    options.refresh_stages = request.refresh_stages.into_iter().collect();
    if let Some(size) = request.chunk_size {
        options.chunk_size = size.max(1);
    }

    let corpus = load_corpus(&request.corpus)?;
    info!(
        corpus = %request.corpus.display(),
        records = corpus.len(),
        state_dir = %state_dir.display(),
        "starting paperflow run"
    );

    let ctx = RunContext::new(state_dir, options);
    let reporter = CliProgress::new();
    let report = Orchestrator::new(pipeline)
        .run(&ctx, corpus, &reporter)
        .await?;

    print_summary(&report);
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!();
    if report.is_zero_work() {
        println!("  Nothing to do: all {} records are up to date.", report.corpus_size);
        println!();
        return;
    }

    println!("  Run {} finished", report.run_id);
    println!("  Pending:   {} of {}", report.pending, report.corpus_size);
    println!("  Completed: {}", report.completed);
    println!("  Rejected:  {} (quality gate)", report.rejected);
    println!("  Failed:    {} (retried next run)", report.failed);
    println!("  Time:      {:.1}s", report.elapsed_ms as f64 / 1000.0);
    println!();
    println!(
        "  {:<16} {:>8} {:>10} {:>8} {:>9}",
        "STAGE", "CACHED", "PROCESSED", "FAILED", "REJECTED"
    );
    for stage in &report.stages {
        println!(
            "  {:<16} {:>8} {:>10} {:>8} {:>9}",
            format!("{}@{}", stage.name, stage.version),
            stage.counts.cache_hits,
            stage.counts.processed,
            stage.counts.failed,
            stage.counts.rejected
        );
    }

    if !report.failures.is_empty() {
        const SHOWN: usize = 20;
        println!();
        println!("  Failures:");
        for f in report.failures.iter().take(SHOWN) {
            let note = if f.committed { "" } else { " (pending)" };
            println!("    {} @ {}: {}{note}", f.record_id, f.stage, f.kind);
        }
        if report.failures.len() > SHOWN {
            println!("    ... and {} more (see `paperflow failures`)", report.failures.len() - SHOWN);
        }
    }
    println!();
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
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn stage_started(&self, stage: &str, total: usize) {
        self.spinner.set_message(format!("{stage} [0/{total}]"));
    }

    fn stage_progress(&self, stage: &str, done: usize, total: usize) {
        self.spinner.set_message(format!("{stage} [{done}/{total}]"));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Inspection commands
// ---------------------------------------------------------------------------

async fn cmd_status(env: &Env) -> Result<()> {
    let config = env.load_config()?;
    let layout = StateLayout::new(env.state_dir(&config)?);
    let signature = build_pipeline(&config)?.signature();

    let manifest = layout.manifest().load()?;
    let (completed, rejected) = manifest.counts();
    println!("State:      {}", layout.root().display());
    println!("Pipeline:   {} (signature {signature})", config.pipeline.stages.join(" → "));
    println!("Exited:     {completed} completed, {rejected} rejected");
    println!("Stale:      {} (will rerun)", manifest.stale_count(&signature));
    if let Some(at) = manifest.last_update {
        println!("Committed:  {}", at.to_rfc3339());
    }
    if !manifest.stage_versions.is_empty() {
        let versions: Vec<String> = manifest
            .stage_versions
            .iter()
            .map(|(name, v)| format!("{name}@{v}"))
            .collect();
        println!("Versions:   {}", versions.join(", "));
    }

    let checkpoints = layout.checkpoints().list();
    if !checkpoints.is_empty() {
        println!("Interrupted run detected:");
        for cp in checkpoints {
            println!(
                "  {}@{}: {} processed, {} cached, {} failed (run {}, at {})",
                cp.stage_name,
                cp.stage_version,
                cp.counts.processed,
                cp.counts.cache_hits,
                cp.counts.failed,
                cp.run_id,
                cp.updated_at.to_rfc3339()
            );
        }
    }

    let logged = layout.failures().failed_ids()?;
    let outstanding = layout.outstanding_failures().await?;
    println!(
        "Failures:   {} outstanding ({} records in the failure log)",
        outstanding.len(),
        logged.len()
    );

    if layout.records_db_path().exists() {
        let store = layout.open_records().await?;
        let counts = store.counts().await?;
        println!(
            "Records:    {} completed, {} rejected, {} searchable",
            counts.completed, counts.rejected, counts.searchable
        );
        if let Some(run) = store.last_run().await? {
            let finished = run.finished_at.as_deref().unwrap_or("unfinished");
            println!("Last run:   {} ({} → {finished})", run.run_id, run.started_at);
        }
    }
    Ok(())
}

fn cmd_failures(env: &Env, stage: Option<&str>, limit: usize) -> Result<()> {
    let failures = env.layout()?.failures();
    let records = match stage {
        Some(stage) => failures.for_stage(stage)?,
        None => failures.read_all()?,
    };
    if records.is_empty() {
        println!("No failures logged.");
        return Ok(());
    }

    let skip = records.len().saturating_sub(limit);
    for f in &records[skip..] {
        println!(
            "{}  {:<12} {:<24} {:<14} x{}  {}",
            f.timestamp.format("%Y-%m-%d %H:%M:%S"),
            f.stage_name,
            f.record_id,
            f.error_kind,
            f.attempts,
            f.message
        );
    }
    if skip > 0 {
        println!("({skip} older entries not shown)");
    }
    Ok(())
}

async fn cmd_show(env: &Env, record_id: &str) -> Result<()> {
    let layout = env.layout()?;
    if !layout.records_db_path().exists() {
        return Err(eyre!("no record store at {}", layout.root().display()));
    }
    let store = layout.open_records().await?;
    let record = store
        .get(record_id)
        .await?
        .ok_or_else(|| eyre!("record '{record_id}' has not exited the pipeline"))?;

    let out = serde_json::json!({
        "record_id": record.record_id,
        "status": record.status.as_str(),
        "searchable": record.searchable,
        "score": record.score,
        "components": record.components,
        "run_id": record.run_id,
        "updated_at": record.updated_at.to_rfc3339(),
        "fields": record.fields,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Cache commands
// ---------------------------------------------------------------------------

fn cmd_cache_stats(env: &Env) -> Result<()> {
    let stats = env.layout()?.cache().stats()?;
    if stats.is_empty() {
        println!("Cache is empty.");
        return Ok(());
    }
    println!("{:<16} {:>8} {:>12}", "STAGE", "ENTRIES", "BYTES");
    for s in stats {
        println!("{:<16} {:>8} {:>12}", s.stage, s.entries, s.bytes);
    }
    Ok(())
}

fn cmd_cache_clear(env: &Env, stage: Option<&str>) -> Result<()> {
    let removed = env.layout()?.cache().clear(stage)?;
    match stage {
        Some(stage) => println!("Removed {removed} cached results for '{stage}'."),
        None => println!("Removed {removed} cached results."),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(env: &Env) -> Result<()> {
    let config: AppConfig = env.load_config()?;
    validate_config(&config)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
