use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use newsfeed_sync::{build_stack, CycleStatus, Scheduler, SyncConfig};
use newsfeed_web::{AppState, WebConfig};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt as tfmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "newsfeed-cli")]
#[command(about = "Incremental news ingestion service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle and exit.
    Sync {
        /// Exit non-zero when the cycle fails.
        #[arg(long)]
        strict: bool,
    },
    /// Run the scheduler and the HTTP read surface.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        /// Serve reads only; do not ingest.
        #[arg(long)]
        no_scheduler: bool,
    },
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { strict: false }) {
        Commands::Sync { strict } => {
            let report = newsfeed_sync::run_sync_once_from_env().await?;
            println!(
                "sync {:?}: run_id={} fetched={} skipped={} inserted={} updated={} failed={} watermark={}",
                report.status,
                report.run_id,
                report.fetched,
                report.skipped_total(),
                report.inserted,
                report.updated,
                report.failed_upserts.len(),
                report
                    .watermark_after
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "none".to_string()),
            );
            if let Some(failure) = &report.failure {
                eprintln!("cycle failed during {:?}: {}", failure.phase, failure.message);
            }
            if strict && report.status == CycleStatus::Failed {
                anyhow::bail!("ingest cycle {} failed", report.run_id);
            }
        }
        Commands::Serve { port, no_scheduler } => serve(port, no_scheduler).await?,
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let pool = newsfeed_storage::connect_pool(&config.database_url).await?;
            newsfeed_storage::run_migrations(&pool).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn serve(port: Option<u16>, no_scheduler: bool) -> Result<()> {
    let config = SyncConfig::from_env()?;
    let stack = build_stack(&config).await?;
    let mut state = AppState::new(stack.query.clone());

    let scheduler = if no_scheduler {
        None
    } else {
        let scheduler = Arc::new(Scheduler::new(stack.job.clone(), stack.schedule.clone()));
        scheduler.start().await?;
        // First cycle runs now instead of one full interval after startup.
        tokio::spawn({
            let scheduler = scheduler.clone();
            async move {
                scheduler.trigger().await;
            }
        });
        state = state.with_scheduler(scheduler.clone());
        Some(scheduler)
    };

    let port = port.unwrap_or_else(|| WebConfig::from_env().port);
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler failed; shutting down");
        }
        info!("shutdown requested");
    };
    newsfeed_web::serve(listener, state, shutdown).await?;

    if let Some(scheduler) = scheduler {
        scheduler.stop().await?;
    }
    Ok(())
}
