use std::path::PathBuf;
use std::sync::Arc;

use adwatch_core::retention_cutoff;
use adwatch_storage::{ListingStore, SqliteLedger};
use adwatch_sync::{Monitor, MonitorConfig, PassOutcome};
use adwatch_web::{render_rss, ChannelInfo, FeedAssembler};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "adwatch")]
#[command(about = "Marketplace listing monitor with an RSS feed")]
struct Cli {
    /// Config file; defaults to $ADWATCH_CONFIG or ./adwatch.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a pass now, then every refresh interval, and serve the feed.
    Serve,
    /// Run a single ingestion pass and exit.
    RunOnce,
    /// Create the ledger database and apply migrations.
    InitDb,
    /// Delete ledger entries older than the ledger retention window.
    Prune,
    /// Print the current RSS document to stdout.
    Feed,
}

/// `RUST_LOG` wins; otherwise `LOG_LEVEL`, defaulting to `info`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into())))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("listening for ctrl-c: {err}");
    }
    info!("shutdown requested");
}

async fn open_ledger(config: &MonitorConfig) -> Result<SqliteLedger> {
    SqliteLedger::connect(&config.database_url)
        .await
        .with_context(|| format!("opening ledger at {}", config.database_url))
}

async fn serve(config: MonitorConfig) -> Result<()> {
    let monitor = Monitor::open(config).await?;
    let mut sched = monitor.scheduler().await?;
    sched.start().await.context("starting scheduler")?;

    let coordinator = Arc::clone(&monitor.coordinator);
    tokio::spawn(async move {
        coordinator.run_pass().await;
    });

    let served = adwatch_web::serve(&monitor, shutdown_signal()).await;
    sched.shutdown().await.context("stopping scheduler")?;
    monitor.close().await;
    served
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(MonitorConfig::path_from_env);
    let config = MonitorConfig::load(&path).with_context(|| format!("loading config {}", path.display()))?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::RunOnce => {
            let monitor = Monitor::open(config).await?;
            let outcome = monitor.coordinator.run_pass().await;
            monitor.close().await;
            match outcome {
                PassOutcome::Completed(summary) => println!(
                    "pass complete: pass_id={} sources={} failed={} new={} touched={} refreshed={} store_errors={}",
                    summary.pass_id,
                    summary.sources_attempted,
                    summary.sources_failed,
                    summary.new_listings,
                    summary.touched,
                    summary.refreshed,
                    summary.store_errors
                ),
                PassOutcome::Skipped => println!("pass skipped: another pass is running"),
                PassOutcome::Failed { pass_id, error } => anyhow::bail!("pass {pass_id} failed: {error}"),
            }
        }
        Commands::InitDb => {
            let ledger = open_ledger(&config).await?;
            ledger.close().await;
            println!("ledger ready at {}", config.database_url);
        }
        Commands::Prune => {
            let ledger = open_ledger(&config).await?;
            let cutoff = retention_cutoff(Utc::now(), config.ledger_retention());
            let deleted = ledger.prune(cutoff).await.context("pruning ledger")?;
            ledger.close().await;
            println!("pruned {deleted} entries last checked before {cutoff}");
        }
        Commands::Feed => {
            let ledger = Arc::new(open_ledger(&config).await?);
            let items = FeedAssembler::new(ledger.clone(), &config.feed).build_feed().await;
            let xml = render_rss(&ChannelInfo::from(&config.feed), &items, Utc::now())?;
            ledger.close().await;
            println!("{xml}");
        }
    }

    Ok(())
}
