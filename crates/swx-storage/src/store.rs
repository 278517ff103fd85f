//! Event store contract and the in-memory implementation.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use swx_core::{EventCategory, EventIdentity, ResolvedEvent, StoredEvent};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertDisposition {
    Inserted,
    Updated,
    /// A newer write already landed for this identity; nothing was changed.
    Stale,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Connectivity(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("write rejected for {identity}: {message}")]
    Write { identity: String, message: String },
    #[error("stored row is unreadable: {0}")]
    Decode(String),
    #[error("schema bootstrap failed: {0}")]
    Schema(String),
}

impl StoreError {
    /// Errors that mean no further writes can succeed on this handle.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connectivity(_) | StoreError::Timeout(_))
    }
}

/// Persistent record store keyed by [`EventIdentity`].
///
/// `upsert` must be a single conditional write per identity: insert when
/// absent, otherwise overlay the slots and top-level payload keys the incoming
/// event carries and advance `last_seen_at`/`last_modified_at`, unless the
/// stored record was modified later than `observed_at`. Fields the incoming
/// event omits keep their stored values. `first_seen_at` is never rewritten.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn upsert(
        &self,
        resolved: &ResolvedEvent,
        observed_at: DateTime<Utc>,
    ) -> Result<UpsertDisposition, StoreError>;

    async fn get(&self, identity: &EventIdentity) -> Result<Option<StoredEvent>, StoreError>;

    /// Newest first by `occurred_at`, ties broken by identity.
    async fn latest_by_category(
        &self,
        category: EventCategory,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// All events, newest first by `occurred_at`, ties broken by identity.
    async fn page(&self, offset: usize, limit: usize) -> Result<Vec<StoredEvent>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

/// Produces a fresh store handle; called again after a connectivity failure.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn EventStore>, StoreError>;
}

/// Process-local store for dry runs and tests. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventStore {
    events: Arc<Mutex<HashMap<EventIdentity, StoredEvent>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<StoredEvent> {
        let mut events: Vec<_> = self.events.lock().await.values().cloned().collect();
        sort_newest_first(&mut events);
        events
    }
}

fn sort_newest_first(events: &mut [StoredEvent]) {
    events.sort_by(|a, b| {
        b.event
            .occurred_at
            .cmp(&a.event.occurred_at)
            .then_with(|| a.identity.key().cmp(&b.identity.key()))
    });
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upsert(
        &self,
        resolved: &ResolvedEvent,
        observed_at: DateTime<Utc>,
    ) -> Result<UpsertDisposition, StoreError> {
        let mut events = self.events.lock().await;
        match events.entry(resolved.identity.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(StoredEvent {
                    identity: resolved.identity.clone(),
                    event: resolved.event.clone(),
                    first_seen_at: observed_at,
                    last_seen_at: observed_at,
                    last_modified_at: observed_at,
                });
                Ok(UpsertDisposition::Inserted)
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.last_modified_at > observed_at {
                    return Ok(UpsertDisposition::Stale);
                }
                record.event.merge_from(&resolved.event);
                record.last_seen_at = observed_at;
                record.last_modified_at = observed_at;
                Ok(UpsertDisposition::Updated)
            }
        }
    }

    async fn get(&self, identity: &EventIdentity) -> Result<Option<StoredEvent>, StoreError> {
        Ok(self.events.lock().await.get(identity).cloned())
    }

    async fn latest_by_category(
        &self,
        category: EventCategory,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let mut events: Vec<_> = self
            .events
            .lock()
            .await
            .values()
            .filter(|e| e.identity.category() == category)
            .cloned()
            .collect();
        sort_newest_first(&mut events);
        events.truncate(limit);
        Ok(events)
    }

    async fn page(&self, offset: usize, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        Ok(self
            .snapshot()
            .await
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.events.lock().await.len() as u64)
    }
}

#[async_trait]
impl StoreConnector for MemoryEventStore {
    async fn connect(&self) -> Result<Arc<dyn EventStore>, StoreError> {
        Ok(Arc::new(self.clone()))
    }
}
