//! Sync orchestration: configuration, window planning, the upsert engine,
//! the per-cycle pipeline and the poll scheduler.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use swx_adapters::load_archived_response;
use swx_core::EventCategory;
use swx_storage::{MemoryEventStore, PgConnector, StoreConnector};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

pub mod config;
pub mod pipeline;
pub mod scheduler;
pub mod upsert;
pub mod window;

#[cfg(test)]
mod testing;

pub use config::{FeedConfig, FeedRegistry, SyncConfig};
pub use pipeline::{ingest_batches, CycleError, CycleReport, SyncPipeline};
pub use scheduler::{PollScheduler, PollState, StageOutcome};
pub use upsert::{UpsertCounts, UpsertEngine};
pub use window::WindowPlanner;

pub const CRATE_NAME: &str = "swx-sync";

/// PostgreSQL for real runs, a throwaway in-memory store for dry runs.
pub fn store_connector(config: &SyncConfig, dry_run: bool) -> Arc<dyn StoreConnector> {
    if dry_run {
        Arc::new(MemoryEventStore::new())
    } else {
        Arc::new(PgConnector::new(config.pg_store_config()))
    }
}

pub fn build_scheduler(config: &SyncConfig, connector: Arc<dyn StoreConnector>) -> Result<PollScheduler> {
    let pipeline = SyncPipeline::new(config).context("building sync pipeline")?;
    Ok(PollScheduler::new(pipeline, connector, config.poll_interval))
}

pub async fn run_sync_once_from_env(dry_run: bool) -> Result<CycleReport> {
    let config = SyncConfig::from_env()?;
    let mut scheduler = build_scheduler(&config, store_connector(&config, dry_run))?;
    Ok(scheduler.tick().await?)
}

pub async fn run_poll_loop_from_env(shutdown: watch::Receiver<bool>) -> Result<u64> {
    let config = SyncConfig::from_env()?;
    let scheduler = build_scheduler(&config, store_connector(&config, false))?;
    Ok(scheduler.run(shutdown).await)
}

pub async fn migrate_from_env() -> Result<()> {
    let config = SyncConfig::from_env()?;
    PgConnector::new(config.pg_store_config())
        .connect_store()
        .await
        .context("applying event store schema")?;
    info!("event store schema is current");
    Ok(())
}

/// Re-ingest an archived response body through normalize, resolve and upsert.
pub async fn replay_file_from_env(category: EventCategory, path: &Path, dry_run: bool) -> Result<CycleReport> {
    let config = SyncConfig::from_env()?;
    let batch = load_archived_response(path, category)?;
    let store = store_connector(&config, dry_run)
        .connect()
        .await
        .context("connecting to event store")?;
    let run_id = Uuid::new_v4();
    let report = ingest_batches(store, vec![batch], run_id, Utc::now()).await?;
    report.log_summary("replayed");
    Ok(report)
}
