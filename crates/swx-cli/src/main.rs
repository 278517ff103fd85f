use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use swx_core::EventCategory;
use swx_sync::CycleReport;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "swx")]
#[command(about = "Space-weather event ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one poll cycle and exit.
    Sync {
        /// Write to an in-memory store instead of PostgreSQL.
        #[arg(long)]
        dry_run: bool,
    },
    /// Poll on the configured interval until interrupted.
    Run,
    /// Create the events table and its indexes.
    Migrate,
    /// Re-ingest an archived category response body.
    Replay {
        #[arg(long)]
        category: EventCategory,
        file: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SWX_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_report(label: &str, report: &CycleReport) {
    println!(
        "{label}: run_id={} fetched={} malformed={} inserted={} updated={} stale={} write_failures={} fetch_failures={}",
        report.run_id,
        report.fetched,
        report.malformed,
        report.inserted,
        report.updated,
        report.stale,
        report.write_failures,
        report.fetch_failures
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let report = swx_sync::run_sync_once_from_env(dry_run).await?;
            print_report("sync complete", &report);
        }
        Commands::Run => {
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "could not listen for interrupt; terminate the process to stop");
                    std::future::pending::<()>().await;
                }
                info!("interrupt received; stopping after the current cycle");
                let _ = tx.send(true);
            });
            let cycles = swx_sync::run_poll_loop_from_env(rx).await?;
            println!("poll loop stopped after {cycles} cycles");
        }
        Commands::Migrate => {
            swx_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::Replay {
            category,
            file,
            dry_run,
        } => {
            let report = swx_sync::replay_file_from_env(category, &file, dry_run)
                .await
                .with_context(|| format!("replaying {}", file.display()))?;
            print_report("replay complete", &report);
        }
    }

    Ok(())
}
