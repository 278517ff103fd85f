//! One ingestion pass: concurrent per-category fetch, normalize and resolve,
//! then per-category upsert batches in category order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use swx_adapters::{AdapterContext, FeedAdapter, FeedBatch, FetchFailure};
use swx_core::{EventCategory, FetchWindow, ResolvedEvent};
use swx_storage::{ArtifactStore, EventStore, HttpFetcher, RetryDisposition, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{FeedRegistry, SyncConfig};
use crate::upsert::{collapse_duplicates, UpsertCounts, UpsertEngine};
use crate::window::WindowPlanner;

/// Per-cycle counters, logged once per cycle and returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub window: Option<FetchWindow>,
    pub fetched: usize,
    pub malformed: usize,
    pub normalized: usize,
    pub inserted: usize,
    pub updated: usize,
    pub stale: usize,
    pub write_failures: usize,
    pub fetch_failures: usize,
}

impl CycleReport {
    pub fn new(run_id: Uuid, window: Option<FetchWindow>) -> Self {
        Self {
            run_id,
            window,
            fetched: 0,
            malformed: 0,
            normalized: 0,
            inserted: 0,
            updated: 0,
            stale: 0,
            write_failures: 0,
            fetch_failures: 0,
        }
    }

    fn absorb_upserts(&mut self, counts: UpsertCounts) {
        self.inserted += counts.inserted;
        self.updated += counts.updated;
        self.stale += counts.stale;
        self.write_failures += counts.write_failures;
    }

    /// `degraded` when the cycle completed but some category or write was skipped.
    pub fn outcome(&self) -> &'static str {
        if self.fetch_failures == 0 && self.write_failures == 0 {
            "succeeded"
        } else {
            "degraded"
        }
    }

    pub fn log_summary(&self, outcome: &str) {
        let (window_start, window_end) = self
            .window
            .map(|w| w.query_dates())
            .unwrap_or_default();
        info!(
            run_id = %self.run_id,
            outcome,
            window_start = %window_start,
            window_end = %window_end,
            fetched = self.fetched,
            malformed = self.malformed,
            normalized = self.normalized,
            inserted = self.inserted,
            updated = self.updated,
            stale = self.stale,
            write_failures = self.write_failures,
            fetch_failures = self.fetch_failures,
            "poll cycle finished"
        );
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("could not reach the event store: {0}")]
    Connect(#[source] StoreError),
    #[error("every category fetch failed ({} categories)", .report.fetch_failures)]
    AllFetchesFailed { report: CycleReport },
    #[error("store connectivity lost mid-cycle: {source}")]
    StoreConnectivity {
        report: CycleReport,
        #[source]
        source: StoreError,
    },
}

impl CycleError {
    /// Counts gathered before the failure, when the cycle got that far.
    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            CycleError::Connect(_) => None,
            CycleError::AllFetchesFailed { report } | CycleError::StoreConnectivity { report, .. } => {
                Some(report)
            }
        }
    }
}

#[derive(Debug)]
pub struct FetchStage {
    pub batches: Vec<FeedBatch>,
    pub failures: Vec<FetchFailure>,
}

impl FetchStage {
    pub fn all_failed(&self) -> bool {
        self.batches.is_empty() && !self.failures.is_empty()
    }
}

/// Resolved events for one category, ready for the upsert engine.
#[derive(Debug, Clone)]
pub struct CategoryBatch {
    pub category: EventCategory,
    pub events: Vec<ResolvedEvent>,
}

/// Normalize and resolve every fetched event, collapsing in-batch duplicates.
/// Output is ordered by category.
pub fn resolve_batches(mut batches: Vec<FeedBatch>, report: &mut CycleReport) -> Vec<CategoryBatch> {
    batches.sort_by_key(|b| b.category);
    batches
        .into_iter()
        .map(|batch| {
            report.fetched += batch.events.len();
            report.malformed += batch.malformed_entries;
            let resolved: Vec<ResolvedEvent> =
                batch.events.into_iter().map(ResolvedEvent::from_raw).collect();
            let events = collapse_duplicates(resolved);
            report.normalized += events.len();
            CategoryBatch {
                category: batch.category,
                events,
            }
        })
        .collect()
}

/// Write category batches in order. Committed counts land in `report` even
/// when connectivity is lost part way.
pub async fn upsert_batches(
    store: Arc<dyn EventStore>,
    batches: Vec<CategoryBatch>,
    observed_at: DateTime<Utc>,
    report: &mut CycleReport,
) -> Result<(), StoreError> {
    let engine = UpsertEngine::new(store);
    for batch in batches {
        let category = batch.category;
        match engine.apply(batch.events, observed_at).await {
            Ok(counts) => {
                debug!(
                    %category,
                    inserted = counts.inserted,
                    updated = counts.updated,
                    stale = counts.stale,
                    write_failures = counts.write_failures,
                    "category batch upserted"
                );
                report.absorb_upserts(counts);
            }
            Err(aborted) => {
                report.absorb_upserts(aborted.partial);
                warn!(%category, error = %aborted, "upsert aborted");
                return Err(aborted.source);
            }
        }
    }
    Ok(())
}

/// Normalize, resolve and upsert already-fetched batches in one go.
pub async fn ingest_batches(
    store: Arc<dyn EventStore>,
    batches: Vec<FeedBatch>,
    run_id: Uuid,
    observed_at: DateTime<Utc>,
) -> Result<CycleReport, CycleError> {
    let mut report = CycleReport::new(run_id, None);
    let resolved = resolve_batches(batches, &mut report);
    match upsert_batches(store, resolved, observed_at, &mut report).await {
        Ok(()) => Ok(report),
        Err(source) => Err(CycleError::StoreConnectivity { report, source }),
    }
}

pub struct SyncPipeline {
    adapters: Vec<Arc<dyn FeedAdapter>>,
    http: HttpFetcher,
    api_key: String,
    planner: WindowPlanner,
    archive: Option<ArtifactStore>,
}

impl SyncPipeline {
    pub fn new(config: &SyncConfig) -> anyhow::Result<Self> {
        let registry = FeedRegistry::load_or_default(&config.feeds_file)?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let pipeline = Self::from_parts(
            registry.adapters(&config.base_url),
            http,
            config.api_key.clone(),
            WindowPlanner::new(config.lookback_days),
        );
        Ok(match &config.artifacts_dir {
            Some(dir) => pipeline.with_archive(ArtifactStore::new(dir.clone())),
            None => pipeline,
        })
    }

    pub fn from_parts(
        adapters: Vec<Arc<dyn FeedAdapter>>,
        http: HttpFetcher,
        api_key: impl Into<String>,
        planner: WindowPlanner,
    ) -> Self {
        Self {
            adapters,
            http,
            api_key: api_key.into(),
            planner,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: ArtifactStore) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn planner(&self) -> &WindowPlanner {
        &self.planner
    }

    pub fn context(&self, run_id: Uuid, fetched_at: DateTime<Utc>) -> AdapterContext {
        AdapterContext {
            run_id,
            api_key: self.api_key.clone(),
            fetched_at,
        }
    }

    /// Fetch every category concurrently. A failure is scoped to its category.
    pub async fn fetch(&self, ctx: &AdapterContext, window: FetchWindow) -> FetchStage {
        let results = join_all(
            self.adapters
                .iter()
                .map(|adapter| adapter.fetch_window(&self.http, ctx, window)),
        )
        .await;

        let mut batches = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(batch) => {
                    debug!(
                        category = %batch.category,
                        events = batch.events.len(),
                        malformed = batch.malformed_entries,
                        "category fetched"
                    );
                    self.archive_batch(ctx, &batch).await;
                    batches.push(batch);
                }
                Err(failure) => {
                    warn!(
                        category = %failure.category,
                        retryable = failure.disposition() == RetryDisposition::Retryable,
                        error = %failure,
                        "category fetch failed"
                    );
                    failures.push(failure);
                }
            }
        }
        FetchStage { batches, failures }
    }

    async fn archive_batch(&self, ctx: &AdapterContext, batch: &FeedBatch) {
        let Some(archive) = &self.archive else {
            return;
        };
        if batch.raw_body.is_empty() {
            return;
        }
        match archive
            .store_response(ctx.fetched_at, batch.category.slug(), &batch.raw_body)
            .await
        {
            Ok(artifact) => debug!(
                category = %batch.category,
                path = %artifact.relative_path.display(),
                deduplicated = artifact.deduplicated,
                "archived raw response"
            ),
            Err(err) => warn!(category = %batch.category, error = %err, "failed to archive raw response"),
        }
    }
}
