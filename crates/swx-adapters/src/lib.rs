//! Per-category feed adapters: one outbound request per category per window.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use swx_core::{EventCategory, FetchWindow, RawEvent};
use swx_storage::{FetchError, HttpFetcher, RetryDisposition};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "swx-adapters";

pub const DEFAULT_BASE_URL: &str = "https://api.nasa.gov/DONKI";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub api_key: String,
    pub fetched_at: DateTime<Utc>,
}

/// Events parsed from one category response, already stamped with the category.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedBatch {
    pub category: EventCategory,
    pub events: Vec<RawEvent>,
    /// Array entries that were not JSON objects and were skipped.
    pub malformed_entries: usize,
    /// Response body as received, kept for the raw archive. Empty for synthetic batches.
    pub raw_body: Vec<u8>,
}

impl FeedBatch {
    pub fn new(category: EventCategory, events: Vec<RawEvent>) -> Self {
        Self {
            category,
            events,
            malformed_entries: 0,
            raw_body: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchFailureCause {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("malformed response body: {0}")]
    Malformed(String),
}

/// One category's fetch failed. Scoped to that category; other categories proceed.
#[derive(Debug, Error)]
#[error("{category} fetch failed: {cause}")]
pub struct FetchFailure {
    pub category: EventCategory,
    #[source]
    pub cause: FetchFailureCause,
}

impl FetchFailure {
    pub fn new(category: EventCategory, cause: impl Into<FetchFailureCause>) -> Self {
        Self {
            category,
            cause: cause.into(),
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match &self.cause {
            FetchFailureCause::Transport(err) => err.disposition(),
            FetchFailureCause::Malformed(_) => RetryDisposition::Retryable,
        }
    }
}

#[async_trait]
pub trait FeedAdapter: Send + Sync {
    fn category(&self) -> EventCategory;

    fn endpoint(&self) -> &str;

    async fn fetch_window(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        window: FetchWindow,
    ) -> Result<FeedBatch, FetchFailure>;
}

/// Parse a category response body. An empty body is an empty collection;
/// anything other than a JSON array is malformed; non-object entries are
/// skipped and counted.
pub fn parse_feed_body(category: EventCategory, body: &[u8]) -> Result<FeedBatch, FetchFailureCause> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(FeedBatch {
            raw_body: body.to_vec(),
            ..FeedBatch::new(category, Vec::new())
        });
    }

    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| FetchFailureCause::Malformed(e.to_string()))?;
    let entries = match value {
        JsonValue::Array(entries) => entries,
        other => {
            return Err(FetchFailureCause::Malformed(format!(
                "expected a JSON array, got {}",
                json_kind(&other)
            )))
        }
    };

    let mut events = Vec::with_capacity(entries.len());
    let mut malformed_entries = 0usize;
    for entry in entries {
        match entry {
            JsonValue::Object(payload) => events.push(RawEvent::new(category, payload)),
            other => {
                malformed_entries += 1;
                debug!(%category, kind = json_kind(&other), "skipping non-object feed entry");
            }
        }
    }

    Ok(FeedBatch {
        category,
        events,
        malformed_entries,
        raw_body: body.to_vec(),
    })
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Adapter for one DONKI category endpoint.
#[derive(Debug, Clone)]
pub struct DonkiAdapter {
    category: EventCategory,
    endpoint: String,
}

impl DonkiAdapter {
    pub fn new(category: EventCategory, endpoint: impl Into<String>) -> Self {
        Self {
            category,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl FeedAdapter for DonkiAdapter {
    fn category(&self) -> EventCategory {
        self.category
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch_window(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        window: FetchWindow,
    ) -> Result<FeedBatch, FetchFailure> {
        let (start_date, end_date) = window.query_dates();
        let query = [
            ("startDate", start_date),
            ("endDate", end_date),
            ("api_key", ctx.api_key.clone()),
        ];
        let response = http
            .fetch_bytes(ctx.run_id, self.category.slug(), &self.endpoint, &query)
            .await
            .map_err(|err| FetchFailure::new(self.category, err))?;

        let batch = parse_feed_body(self.category, &response.body)
            .map_err(|cause| FetchFailure::new(self.category, cause))?;
        if batch.malformed_entries > 0 {
            warn!(
                category = %self.category,
                malformed = batch.malformed_entries,
                "feed response contained non-object entries"
            );
        }
        Ok(batch)
    }
}

/// `{base}/{CODE}` with any trailing slash on the base trimmed.
pub fn default_endpoint(base_url: &str, category: EventCategory) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), category.feed_code())
}

pub fn adapter_for_category(base_url: &str, category: EventCategory) -> Box<dyn FeedAdapter> {
    Box::new(DonkiAdapter::new(category, default_endpoint(base_url, category)))
}

/// Load a previously archived (or hand-captured) response body for replay.
pub fn load_archived_response(path: impl AsRef<Path>, category: EventCategory) -> Result<FeedBatch> {
    let path = path.as_ref();
    let body = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_feed_body(category, &body).with_context(|| format!("parsing {}", path.display()))
}
