use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "blh")]
#[command(about = "Broker listing harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every opted-in source once and merge into the master dataset.
    Run,
    /// Summarize the most recent run snapshots as markdown.
    Report {
        #[arg(long, default_value_t = 3)]
        runs: usize,
    },
    /// List control-list sources with their last run status.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run().await,
        Commands::Report { runs } => report(runs),
        Commands::Sources => sources(),
    }
}

async fn run() -> Result<()> {
    let config = blh_sync::SyncConfig::from_env();
    let registry = blh_adapters::builtin_registry();
    let pipeline = Arc::new(blh_sync::SyncPipeline::new(config, registry)?);

    let summary = pipeline.run_once().await?;
    println!(
        "run complete: run_id={} phase={} sources={} new_listings={} master_rows={}",
        summary.run_id,
        summary.phase,
        summary.sources_total,
        summary.new_listings,
        summary.master_rows
    );
    if let Some(path) = &summary.snapshot_path {
        println!("snapshot: {}", path.display());
    }
    for outcome in &summary.outcomes {
        println!("  {}: {} ({})", outcome.source_name, outcome.status, outcome.count);
    }

    if let Some(scheduler) = blh_sync::build_scheduler(Arc::clone(&pipeline)).await? {
        scheduler.start().await?;
        info!(cron = %pipeline.config().sync_cron, "scheduler running, press ctrl-c to stop");
        tokio::signal::ctrl_c().await?;
        info!("shutting down scheduler");
    }

    if !summary.persistence_errors.is_empty() {
        bail!(
            "run finished but {} artifact(s) failed to persist: {}",
            summary.persistence_errors.len(),
            summary.persistence_errors.join("; ")
        );
    }
    Ok(())
}

fn report(runs: usize) -> Result<()> {
    let config = blh_sync::SyncConfig::from_env();
    let markdown = blh_sync::report_markdown(runs, &config.snapshot_dir)?;
    println!("{markdown}");
    Ok(())
}

fn sources() -> Result<()> {
    let config = blh_sync::SyncConfig::from_env();
    let entries = blh_storage::load_control_list(&config.control_list_path)?;
    println!("{} source(s) in {}", entries.len(), config.control_list_path.display());
    for entry in &entries {
        let status = entry
            .status
            .map(|status| status.as_str())
            .unwrap_or("never_run");
        let count = entry.count.unwrap_or(0);
        println!(
            "  {} [{}] status={} count={} url={}",
            entry.site_name,
            if entry.opted_in { "on" } else { "off" },
            status,
            count,
            entry.listing_url
        );
    }
    Ok(())
}
