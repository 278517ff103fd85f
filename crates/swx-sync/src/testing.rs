//! Scripted feeds and stores shared by the pipeline and scheduler tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use swx_adapters::{parse_feed_body, AdapterContext, FeedAdapter, FeedBatch, FetchFailure, FetchFailureCause};
use swx_core::{EventCategory, EventIdentity, FetchWindow, ResolvedEvent, StoredEvent};
use swx_storage::{
    EventStore, HttpClientConfig, HttpFetcher, MemoryEventStore, StoreConnector, StoreError, UpsertDisposition,
};

pub(crate) fn http() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig::default()).unwrap()
}

pub(crate) fn fixture_body(category: EventCategory) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/donki")
        .join(category.feed_code())
        .join("sample.json");
    std::fs::read_to_string(path).unwrap()
}

/// One feed per category serving the checked-in sample responses.
pub(crate) fn fixture_feeds() -> Vec<Arc<dyn FeedAdapter>> {
    EventCategory::ALL
        .into_iter()
        .map(|category| Arc::new(ScriptedFeed::new(category, [fixture_body(category)])) as Arc<dyn FeedAdapter>)
        .collect()
}

enum Script {
    Body(String),
    Outage,
}

/// Serves queued responses in order and repeats the last one forever.
pub(crate) struct ScriptedFeed {
    category: EventCategory,
    endpoint: String,
    script: Mutex<VecDeque<Script>>,
    pub(crate) calls: AtomicUsize,
}

impl ScriptedFeed {
    pub(crate) fn new<I, S>(category: EventCategory, bodies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(category, bodies.into_iter().map(|b| Script::Body(b.into())).collect())
    }

    pub(crate) fn failing(category: EventCategory) -> Self {
        Self::with_script(category, VecDeque::from([Script::Outage]))
    }

    fn with_script(category: EventCategory, script: VecDeque<Script>) -> Self {
        Self {
            category,
            endpoint: format!("scripted://{}", category.feed_code()),
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    /// `None` means the scripted step is an outage.
    fn next_response(&self) -> Option<String> {
        let mut script = self.script.lock().unwrap();
        let step = if script.len() > 1 { script.pop_front() } else { None };
        match step.as_ref().or(script.front()) {
            Some(Script::Body(body)) => Some(body.clone()),
            Some(Script::Outage) | None => None,
        }
    }
}

#[async_trait]
impl FeedAdapter for ScriptedFeed {
    fn category(&self) -> EventCategory {
        self.category
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch_window(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
        _window: FetchWindow,
    ) -> Result<FeedBatch, FetchFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = self.next_response().ok_or_else(|| {
            FetchFailure::new(
                self.category,
                FetchFailureCause::Malformed("scripted outage".to_string()),
            )
        })?;
        parse_feed_body(self.category, body.as_bytes()).map_err(|cause| FetchFailure::new(self.category, cause))
    }
}

/// Loses connectivity for every category ordered at or after `down_from`
/// while the outage flag is set. With `stalls` the loss surfaces as a call
/// timeout instead of a refused connection.
pub(crate) struct OutageStore {
    inner: MemoryEventStore,
    outage: Arc<AtomicBool>,
    down_from: EventCategory,
    stalls: bool,
}

#[async_trait]
impl EventStore for OutageStore {
    async fn upsert(
        &self,
        resolved: &ResolvedEvent,
        observed_at: DateTime<Utc>,
    ) -> Result<UpsertDisposition, StoreError> {
        if self.outage.load(Ordering::SeqCst) && resolved.identity.category() >= self.down_from {
            return Err(if self.stalls {
                StoreError::Timeout(Duration::from_secs(10))
            } else {
                StoreError::Connectivity("connection refused".to_string())
            });
        }
        self.inner.upsert(resolved, observed_at).await
    }

    async fn get(&self, identity: &EventIdentity) -> Result<Option<StoredEvent>, StoreError> {
        self.inner.get(identity).await
    }

    async fn latest_by_category(
        &self,
        category: EventCategory,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.inner.latest_by_category(category, limit).await
    }

    async fn page(&self, offset: usize, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        self.inner.page(offset, limit).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.inner.count().await
    }
}

pub(crate) struct OutageConnector {
    pub(crate) inner: MemoryEventStore,
    pub(crate) outage: Arc<AtomicBool>,
    pub(crate) down_from: EventCategory,
    pub(crate) refuse_connect: AtomicBool,
    pub(crate) stalls: AtomicBool,
    pub(crate) connects: AtomicUsize,
}

impl OutageConnector {
    pub(crate) fn new(inner: MemoryEventStore, down_from: EventCategory) -> Self {
        Self {
            inner,
            outage: Arc::new(AtomicBool::new(false)),
            down_from,
            refuse_connect: AtomicBool::new(false),
            stalls: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StoreConnector for OutageConnector {
    async fn connect(&self) -> Result<Arc<dyn EventStore>, StoreError> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(StoreError::Connectivity("connection refused".to_string()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(OutageStore {
            inner: self.inner.clone(),
            outage: Arc::clone(&self.outage),
            down_from: self.down_from,
            stalls: self.stalls.load(Ordering::SeqCst),
        }))
    }
}
