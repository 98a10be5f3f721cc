mod tree;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{ContentArrangement, Table};
use finrag_bucket::{BucketStore, S3BucketStore, S3Config};
use finrag_core::schema_inspect::{self, ColumnStatus, SchemaReport};
use finrag_core::EtlConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::tree::{format_size, BucketTree};

#[derive(Parser, Debug)]
#[command(author, version, about = "FinRAG bucket and schema diagnostics", long_about = None)]
struct Cli {
    /// ETL config document (YAML, or TOML when the extension is .toml)
    #[arg(long, global = true, default_value = ".aws_config/etl_config.yaml")]
    config: PathBuf,
    /// Env file with AWS credentials
    #[arg(long, global = true, default_value = ".aws_secrets/aws_credentials.env")]
    secrets: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare the historical and incremental schemas
    InspectSchema,
    /// List the bucket grouped by folder
    BucketTree(BucketTreeArgs),
}

#[derive(Args, Debug)]
struct BucketTreeArgs {
    /// Only list keys under this prefix
    #[arg(long, default_value = "")]
    prefix: String,
    /// Stop after this many objects
    #[arg(long, default_value_t = 1000)]
    max_keys: usize,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EtlConfig::from_path(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let store = connect_store(&cli.secrets, &config).await?;

    match cli.command {
        Command::InspectSchema => handle_inspect_schema(store.as_ref(), &config).await,
        Command::BucketTree(args) => handle_bucket_tree(store.as_ref(), args).await,
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

async fn handle_inspect_schema(store: &dyn BucketStore, config: &EtlConfig) -> Result<ExitCode> {
    let report = schema_inspect::inspect(store, config)
        .await
        .context("failed to read input schemas")?;

    println!("Historical:  {} ({} columns)", config.historical_key, report.historical_columns);
    println!("Incremental: {} ({} columns)", config.incremental_key, report.incremental_columns);

    let renames: Vec<_> = report.renames().collect();
    if !renames.is_empty() {
        println!("\nColumn renames applied:");
        for column in renames {
            if let Some(from) = &column.renamed_from {
                println!("  {from} -> {}", column.name);
            }
        }
    }

    println!("\n{}", comparison_table(&report));

    let summary = report.summary();
    println!("\nMatching columns:      {}", summary.matched);
    println!("Historical only:       {}", summary.historical_only);
    println!("Incremental only:      {}", summary.incremental_only);
    println!("Derived (may be absent): {}", summary.derived);
    println!("Type differences:      {}", summary.type_mismatches);
    println!("Datetime precision:    {}", summary.datetime_mismatches);

    let critical: Vec<_> = report.critical_issues().collect();
    if critical.is_empty() {
        println!("\nSchemas are compatible for merge.");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("\n{} critical issue(s):", critical.len());
        for column in critical {
            println!(
                "  - {} ({}): historical {}, incremental {}",
                column.name,
                column.status.label(),
                column.historical_type.as_deref().unwrap_or("missing"),
                column.incremental_type.as_deref().unwrap_or("missing"),
            );
        }
        Ok(ExitCode::FAILURE)
    }
}

fn comparison_table(report: &SchemaReport) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Column", "Historical type", "Incremental type", "Status"]);

    for column in &report.columns {
        let name = match &column.renamed_from {
            Some(from) => format!("{} ({from})", column.name),
            None => column.name.clone(),
        };
        let status = match column.status {
            ColumnStatus::HistoricalOnly | ColumnStatus::IncrementalOnly if column.derived => {
                "derived".to_string()
            }
            status => status.label().to_string(),
        };
        table.add_row(vec![
            name,
            column.historical_type.clone().unwrap_or_else(|| "MISSING".to_string()),
            column.incremental_type.clone().unwrap_or_else(|| "MISSING".to_string()),
            status,
        ]);
    }
    table
}

async fn handle_bucket_tree(store: &dyn BucketStore, args: BucketTreeArgs) -> Result<ExitCode> {
    let tree = BucketTree::list(store, &args.prefix, args.max_keys)
        .await
        .with_context(|| format!("failed to list s3://{}/{}", store.bucket(), args.prefix))?;
    if tree.objects >= args.max_keys {
        warn!(max_keys = args.max_keys, "Listing stopped at --max-keys");
    }

    println!("Bucket s3://{} ({} objects)\n", store.bucket(), tree.objects);
    print!("{}", tree.render());

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Folder", "Files", "Size"]);
    for (folder, totals) in tree.top_level_totals() {
        table.add_row(vec![
            folder,
            totals.files.to_string(),
            format_size(totals.size_mb),
        ]);
    }
    println!("\n{table}");

    Ok(ExitCode::SUCCESS)
}
