//! Poll loop driving one pipeline pass per interval.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use swx_storage::{EventStore, StoreConnector, StoreError};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::pipeline::{resolve_batches, upsert_batches, CycleError, CycleReport, SyncPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollState {
    Idle,
    Fetching,
    Normalizing,
    Upserting,
    Sleeping,
    FailedRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded,
    Failed,
}

impl PollState {
    /// Transition table for the poll loop. A failure in any working state,
    /// including connecting while idle, lands in `FailedRetry`, which always
    /// sleeps the same fixed interval before the next attempt.
    pub fn advance(self, outcome: StageOutcome) -> PollState {
        use PollState::*;
        use StageOutcome::*;
        match (self, outcome) {
            (Idle, Succeeded) => Fetching,
            (Fetching, Succeeded) => Normalizing,
            (Normalizing, Succeeded) => Upserting,
            (Upserting, Succeeded) => Sleeping,
            (Idle | Fetching | Normalizing | Upserting, Failed) => FailedRetry,
            (FailedRetry, _) => Sleeping,
            (Sleeping, _) => Idle,
        }
    }

    pub fn is_working(self) -> bool {
        matches!(
            self,
            PollState::Fetching | PollState::Normalizing | PollState::Upserting
        )
    }
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PollState::Idle => "idle",
            PollState::Fetching => "fetching",
            PollState::Normalizing => "normalizing",
            PollState::Upserting => "upserting",
            PollState::Sleeping => "sleeping",
            PollState::FailedRetry => "failed-retry",
        };
        f.write_str(name)
    }
}

pub struct PollScheduler {
    pipeline: SyncPipeline,
    connector: Arc<dyn StoreConnector>,
    store: Option<Arc<dyn EventStore>>,
    interval: Duration,
    state: PollState,
    cycles: u64,
}

impl PollScheduler {
    pub fn new(pipeline: SyncPipeline, connector: Arc<dyn StoreConnector>, interval: Duration) -> Self {
        Self {
            pipeline,
            connector,
            store: None,
            interval,
            state: PollState::Idle,
            cycles: 0,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Run one full cycle. Leaves the scheduler in `Sleeping` on success and
    /// `FailedRetry` on failure.
    pub async fn tick(&mut self) -> Result<CycleReport, CycleError> {
        self.settle();
        self.cycles += 1;
        let run_id = Uuid::new_v4();
        let span = info_span!("poll_cycle", %run_id, cycle = self.cycles);
        let result = self.run_cycle(run_id).instrument(span.clone()).await;

        span.in_scope(|| match &result {
            Ok(report) => report.log_summary(report.outcome()),
            Err(err) => {
                if let Some(report) = err.report() {
                    report.log_summary("failed");
                }
                error!(error = %err, retry_in_secs = self.interval.as_secs(), "poll cycle failed");
            }
        });
        result
    }

    /// Loop until `shutdown` flips to `true` or its sender goes away. The
    /// signal is observed between cycles and while sleeping; a running cycle
    /// always completes. Returns the number of cycles run.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> u64 {
        info!(interval_secs = self.interval.as_secs(), "poll loop started");
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            // Failures are logged and retried on the next interval.
            let _ = self.tick().await;
            if self.state == PollState::FailedRetry {
                self.transition(StageOutcome::Failed);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
        info!(cycles = self.cycles, "poll loop stopped");
        self.cycles
    }

    async fn run_cycle(&mut self, run_id: Uuid) -> Result<CycleReport, CycleError> {
        let started_at = Utc::now();
        let window = self.pipeline.planner().plan(started_at);
        let mut report = CycleReport::new(run_id, Some(window));

        let store = match self.ensure_store().await {
            Ok(store) => store,
            Err(err) => {
                self.transition(StageOutcome::Failed);
                return Err(CycleError::Connect(err));
            }
        };

        self.transition(StageOutcome::Succeeded);
        let ctx = self.pipeline.context(run_id, started_at);
        let fetched = self.pipeline.fetch(&ctx, window).await;
        report.fetch_failures = fetched.failures.len();
        if fetched.all_failed() {
            self.transition(StageOutcome::Failed);
            return Err(CycleError::AllFetchesFailed { report });
        }

        self.transition(StageOutcome::Succeeded);
        let batches = resolve_batches(fetched.batches, &mut report);

        self.transition(StageOutcome::Succeeded);
        if let Err(source) = upsert_batches(store, batches, Utc::now(), &mut report).await {
            warn!("dropping store handle; reconnecting next cycle");
            self.store = None;
            self.transition(StageOutcome::Failed);
            return Err(CycleError::StoreConnectivity { report, source });
        }

        self.transition(StageOutcome::Succeeded);
        Ok(report)
    }

    async fn ensure_store(&mut self) -> Result<Arc<dyn EventStore>, StoreError> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        let store = self.connector.connect().await?;
        info!("event store handle acquired");
        self.store = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Bring a scheduler left mid-loop back to `Idle` before a new cycle.
    fn settle(&mut self) {
        if self.state == PollState::FailedRetry {
            self.transition(StageOutcome::Failed);
        }
        if self.state == PollState::Sleeping {
            self.transition(StageOutcome::Succeeded);
        }
    }

    fn transition(&mut self, outcome: StageOutcome) {
        let next = self.state.advance(outcome);
        debug!(from = %self.state, to = %next, "poll state");
        self.state = next;
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
