use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use harvest_core::InMemorySeenStore;
use harvest_sync::{HarvestConfig, HarvestMode, HarvestPipeline};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Storefront catalog harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest one batch window into an artifact (default).
    Run(RunArgs),
    /// Index the storefront and print the batch's payload URLs without fetching them.
    Index(WindowArgs),
    /// Run harvests on HARVEST_CRON until interrupted.
    Schedule,
}

#[derive(Debug, Clone, Default, Args)]
struct WindowArgs {
    /// Global offset into the ordered product URL sequence.
    #[arg(long)]
    start: Option<usize>,
    /// Number of product URLs in the batch, 0 = unbounded.
    #[arg(long)]
    size: Option<usize>,
}

impl WindowArgs {
    fn apply(&self, config: &mut HarvestConfig) {
        if let Some(start) = self.start {
            config.window.start = start;
        }
        if let Some(size) = self.size {
            config.window.size = size;
        }
    }
}

#[derive(Debug, Clone, Default, Args)]
struct RunArgs {
    #[command(flatten)]
    window: WindowArgs,
    #[arg(long)]
    concurrency: Option<usize>,
    /// Fetch one payload at a time with HARVEST_THROTTLE_MS between requests.
    #[arg(long)]
    sequential: bool,
    /// Emit rows in URL order instead of completion order.
    #[arg(long)]
    ordered: bool,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut HarvestConfig) {
        self.window.apply(config);
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency.max(1);
        }
        if self.sequential {
            config.mode = HarvestMode::Sequential;
        }
        if self.ordered {
            config.ordered_output = true;
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = HarvestConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            args.apply(&mut config);
            let summary = HarvestPipeline::new(config)?.run_once().await?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serializing run summary")?
                );
            } else {
                println!(
                    "harvest complete: run_id={} urls={} rows={} fetch_failed={} parse_failed={} artifact={} upload={:?}",
                    summary.run_id,
                    summary.urls_selected,
                    summary.rows,
                    summary.fetch_failed,
                    summary.parse_failed,
                    summary.artifact,
                    summary.upload
                );
            }
        }
        Commands::Index(args) => {
            args.apply(&mut config);
            let pipeline = HarvestPipeline::new(config)?;
            let plan = pipeline.plan_batch(&mut InMemorySeenStore::new()).await?;
            for url in &plan.urls {
                println!("{}", url.payload_url());
            }
            eprintln!(
                "index complete: sitemaps={} failed={} indexed={} selected={} duplicates={}",
                plan.catalog.sitemaps_visited,
                plan.catalog.sitemaps_failed,
                plan.catalog.page_urls.len(),
                plan.urls.len(),
                plan.duplicates_skipped
            );
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let cron = config.cron.clone();
            let pipeline = Arc::new(HarvestPipeline::new(config)?);
            let mut sched = pipeline
                .maybe_build_scheduler()
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
