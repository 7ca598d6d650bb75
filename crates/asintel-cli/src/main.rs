use std::path::PathBuf;

use anyhow::Result;
use asintel_sync::{PipelineConfig, RunContext, RunSummary};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "asintel")]
#[command(about = "ASIN review and pricing intelligence")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Commands,
}

/// Flags that take precedence over the `ASINTEL_*` environment.
#[derive(Debug, Args)]
struct Overrides {
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    inbox: Option<PathBuf>,
    #[arg(long, global = true)]
    policy: Option<PathBuf>,
    /// Export CSV even when parquet is available.
    #[arg(long, global = true)]
    csv: bool,
    #[arg(long, global = true)]
    workers: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a collection, optionally seeded with ASINs.
    Init {
        name: String,
        #[arg(long = "asin")]
        asins: Vec<String>,
    },
    /// Append ASINs to a collection.
    AddAsins {
        #[arg(long)]
        collection: String,
        #[arg(required = true)]
        asins: Vec<String>,
    },
    /// Merge inbox batches, then rebuild analytics and exports.
    Collect {
        #[arg(long)]
        collection: String,
    },
    /// Rebuild analytics and exports from stored rows.
    Analyze {
        #[arg(long)]
        collection: String,
    },
    /// Print known review ids for an ASIN as JSON.
    Known {
        #[arg(long)]
        collection: String,
        #[arg(long)]
        asin: String,
    },
    /// Show the most recent run reports.
    Report {
        #[arg(long)]
        collection: String,
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// List collections under the data directory.
    List,
}

fn apply(overrides: Overrides, mut config: PipelineConfig) -> PipelineConfig {
    if let Some(dir) = overrides.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = overrides.inbox {
        config.inbox_dir = dir;
    }
    if let Some(path) = overrides.policy {
        config.policy_path = path;
    }
    if overrides.csv {
        config.prefer_parquet = false;
    }
    if let Some(n) = overrides.workers.filter(|n| *n > 0) {
        config.workers = n;
    }
    config
}

fn print_summary(summary: &RunSummary) {
    for row in &summary.asins {
        match &row.error {
            Some(err) => println!("{}: skipped: {err}", row.asin),
            None => println!(
                "{}: new={} duplicates_skipped={} snapshots={} pages={} stopped={}",
                row.asin,
                row.new_reviews,
                row.duplicates_skipped,
                row.snapshots_written,
                row.pages_visited.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                row.stopped_reason.as_ref().map(|r| r.as_str()).unwrap_or("-"),
            ),
        }
    }
    for file in &summary.rejected_files {
        println!("rejected {}: {}", file.path, file.error);
    }
    println!(
        "run complete: run_id={} export={} reports={}",
        summary.run_id, summary.export.dir, summary.reports_dir
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = apply(cli.overrides, PipelineConfig::from_env());

    match cli.command {
        Commands::Init { name, asins } => {
            let collection = asintel_sync::init_collection(&config, &name, &asins).await?;
            println!(
                "collection {} created with {} asins",
                collection.collection_id,
                collection.asins.len()
            );
        }
        Commands::AddAsins { collection, asins } => {
            let added = asintel_sync::add_asins(&config, &collection, &asins).await?;
            println!("{added} asins added to {collection}");
        }
        Commands::Collect { collection } => {
            let ctx = RunContext::new(&config, &collection)?;
            let summary = asintel_sync::collect(&ctx).await?;
            print_summary(&summary);
        }
        Commands::Analyze { collection } => {
            let ctx = RunContext::new(&config, &collection)?;
            let summary = asintel_sync::analyze(&ctx).await?;
            print_summary(&summary);
        }
        Commands::Known { collection, asin } => {
            let known = asintel_sync::known_reviews(&config, &collection, &asin).await?;
            println!("{}", serde_json::to_string(&known)?);
        }
        Commands::Report { collection, runs } => {
            let store = config.store(&collection);
            println!("{}", asintel_sync::report_markdown(store.dir(), runs)?);
        }
        Commands::List => {
            for id in asintel_storage::list_collections(&config.data_dir).await? {
                println!("{id}");
            }
        }
    }

    Ok(())
}
