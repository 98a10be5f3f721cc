use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use finrag_bucket::{BucketStore, S3BucketStore, S3Config};
use finrag_core::preflight::PreflightChecker;
use finrag_core::{EtlConfig, MergePipeline, RunOutcome};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "FinRAG incremental merge for the S3 fact-sentence table", long_about = None)]
struct Cli {
    #[command(flatten)]
    paths: PathArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct PathArgs {
    /// ETL config document (YAML, or TOML when the extension is .toml)
    #[arg(long, global = true, default_value = ".aws_config/etl_config.yaml")]
    config: PathBuf,
    /// Env file with AWS credentials
    #[arg(long, global = true, default_value = ".aws_secrets/aws_credentials.env")]
    secrets: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge the incremental batch into the final table
    Merge(MergeArgs),
    /// Run pre-flight checks and back up the current final table
    Preflight,
    /// Print the resolved configuration
    ShowConfig,
}

#[derive(Args, Debug, Default)]
struct MergeArgs {
    /// Print the run outcome as JSON instead of a text summary
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Arc::new(
        EtlConfig::from_path(&cli.paths.config)
            .with_context(|| format!("failed to load {}", cli.paths.config.display()))?,
    );

    match cli.command {
        Command::ShowConfig => {
            show_config(&config);
            Ok(ExitCode::SUCCESS)
        }
        Command::Merge(args) => {
            let store = connect_store(&cli.paths.secrets, &config).await?;
            handle_merge(config, store, args).await
        }
        Command::Preflight => {
            let store = connect_store(&cli.paths.secrets, &config).await?;
            handle_preflight(config, store).await
        }
    }
}

async fn connect_store(secrets: &Path, config: &EtlConfig) -> Result<Arc<dyn BucketStore>> {
    match dotenvy::from_path(secrets) {
        Ok(()) => info!(path = %secrets.display(), "Loaded credentials file"),
        Err(err) => warn!(path = %secrets.display(), error = %err, "Credentials file not loaded; using the process environment"),
    }

    let store = S3BucketStore::new(S3Config::from_env(config.bucket.clone()))
        .await
        .context("failed to configure S3 client")?;
    Ok(Arc::new(store))
}

async fn handle_merge(
    config: Arc<EtlConfig>,
    store: Arc<dyn BucketStore>,
    args: MergeArgs,
) -> Result<ExitCode> {
    let pipeline = MergePipeline::new(config, store);
    let outcome = pipeline.run().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(pipeline.config(), &outcome);
    }

    Ok(if outcome.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn handle_preflight(config: Arc<EtlConfig>, store: Arc<dyn BucketStore>) -> Result<ExitCode> {
    let checker = PreflightChecker::new(config.clone(), store);
    let report = checker.run_checks().await;

    for check in &report.checks {
        let mark = if check.passed { "ok  " } else { "FAIL" };
        println!("[{mark}] {:<20} {} ({})", check.name, check.target, check.detail);
    }

    if !report.passed() {
        println!("Pre-flight checks failed; nothing was archived.");
        return Ok(ExitCode::FAILURE);
    }

    let archive = checker
        .archive_existing(Utc::now())
        .await
        .context("failed to back up the final table")?;
    match &archive.archived_as {
        Some(name) => println!("Backed up {} as {}", config.final_key, config.archive_key(name)),
        None => println!("No final table yet; nothing to back up."),
    }
    for key in &archive.deleted {
        println!("Deleted old backup {key}");
    }
    for warning in &archive.warnings {
        println!("Warning: {warning}");
    }

    Ok(ExitCode::SUCCESS)
}

fn show_config(config: &EtlConfig) {
    println!("bucket:        {}", config.bucket);
    println!("historical:    {}", config.s3_uri(&config.historical_key));
    println!("incremental:   {}", config.s3_uri(&config.incremental_key));
    println!("final:         {}", config.s3_uri(&config.final_key));
    println!("compression:   {}", config.compression);
    println!(
        "archive:       {}",
        config.s3_uri(&config.archive_key(config.archive_pattern.template()))
    );
    println!(
        "retention:     {} backup(s), {:?}",
        config.max_backups, config.retention_policy
    );
    println!("run log:       {}", config.s3_uri(&config.log_key()));
    println!(
        "columns:       key={} year={} entity={} text={} company={}",
        config.columns.primary_key,
        config.columns.report_year,
        config.columns.entity_id,
        config.columns.text,
        config.columns.company_name
    );
}

fn print_outcome(config: &EtlConfig, outcome: &RunOutcome) {
    let stats = &outcome.stats;
    println!("Run {} finished: {:?} in {:.2}s", outcome.run_id, outcome.status, outcome.duration_sec);

    for check in outcome.preflight.failures() {
        println!("  pre-flight failed: {} {} ({})", check.name, check.target, check.detail);
    }
    if let Some(archive) = &outcome.archive {
        if let Some(name) = &archive.archived_as {
            println!("  backup:      {}", config.archive_key(name));
        }
    }
    if let Some(base) = &stats.base_key {
        println!("  strategy:    {:?} (base {})", stats.merge_type, base);
        println!("  base rows:   {}", stats.base_rows);
        println!("  incr rows:   {}", stats.incr_rows);
        println!("  final rows:  {}", stats.final_rows);
        println!("  duplicates:  {}", stats.duplicates_removed);
    }
    for action in &outcome.actions {
        println!("  schema:      {action}");
    }
    if outcome.succeeded() {
        let summary = &stats.summary;
        println!("  companies:   {}", summary.companies);
        if let (Some(min), Some(max)) = (summary.year_min, summary.year_max) {
            println!("  years:       {min}-{max}");
        }
        println!("  size:        {:.2} MB", summary.size_mb);
        println!("  written to:  {}", config.s3_uri(&config.final_key));
    }
    if let Some(error) = &outcome.error {
        println!("  error:       {error}");
    }
    for warning in &outcome.warnings {
        println!("  warning:     {warning}");
    }
}
