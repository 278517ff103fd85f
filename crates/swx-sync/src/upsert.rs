//! Dedup/upsert engine: merges resolved events into the store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use swx_core::{EventIdentity, ResolvedEvent};
use swx_storage::{EventStore, StoreError, UpsertDisposition};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
    pub stale: usize,
    pub write_failures: usize,
}

impl UpsertCounts {
    pub fn record(&mut self, disposition: UpsertDisposition) {
        match disposition {
            UpsertDisposition::Inserted => self.inserted += 1,
            UpsertDisposition::Updated => self.updated += 1,
            UpsertDisposition::Stale => self.stale += 1,
        }
    }

    pub fn absorb(&mut self, other: UpsertCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.stale += other.stale;
        self.write_failures += other.write_failures;
    }

    pub fn committed(&self) -> usize {
        self.inserted + self.updated
    }
}

/// The store stopped answering part way through a batch. Writes counted in
/// `partial` are committed.
#[derive(Debug, Error)]
#[error("store connectivity lost after {} committed writes: {source}", .partial.committed())]
pub struct UpsertAborted {
    pub partial: UpsertCounts,
    #[source]
    pub source: StoreError,
}

/// Collapse repeated identities, keeping the position of the first
/// occurrence and the content of the last.
pub fn collapse_duplicates(batch: Vec<ResolvedEvent>) -> Vec<ResolvedEvent> {
    let mut slots: HashMap<EventIdentity, usize> = HashMap::with_capacity(batch.len());
    let mut out: Vec<ResolvedEvent> = Vec::with_capacity(batch.len());
    for resolved in batch {
        match slots.get(&resolved.identity) {
            Some(&idx) => {
                debug!(identity = %resolved.identity, "collapsing duplicate identity in batch");
                out[idx] = resolved;
            }
            None => {
                slots.insert(resolved.identity.clone(), out.len());
                out.push(resolved);
            }
        }
    }
    out
}

#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn EventStore>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Write one batch. Per-identity failures are counted and skipped; a
    /// connectivity failure stops the batch.
    pub async fn apply(
        &self,
        batch: Vec<ResolvedEvent>,
        observed_at: DateTime<Utc>,
    ) -> Result<UpsertCounts, UpsertAborted> {
        let mut counts = UpsertCounts::default();
        for resolved in collapse_duplicates(batch) {
            match self.store.upsert(&resolved, observed_at).await {
                Ok(disposition) => {
                    if disposition == UpsertDisposition::Stale {
                        debug!(identity = %resolved.identity, "skipped stale write");
                    }
                    counts.record(disposition);
                }
                Err(err) if err.is_connectivity() => {
                    return Err(UpsertAborted {
                        partial: counts,
                        source: err,
                    });
                }
                Err(err) => {
                    warn!(identity = %resolved.identity, error = %err, "event write failed");
                    counts.write_failures += 1;
                }
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use swx_core::{EventCategory, RawEvent, StoredEvent};
    use swx_storage::MemoryEventStore;

    fn resolved(category: EventCategory, value: serde_json::Value) -> ResolvedEvent {
        ResolvedEvent::from_raw(RawEvent::new(category, value.as_object().cloned().unwrap()))
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 11, 12, minute, 0).unwrap()
    }

    /// Rejects writes for one identity, loses the connection at another and
    /// times out at a third.
    struct PickyStore {
        inner: MemoryEventStore,
        reject: &'static str,
        unreachable_at: Option<&'static str>,
        stalls_at: Option<&'static str>,
    }

    #[async_trait]
    impl EventStore for PickyStore {
        async fn upsert(
            &self,
            resolved: &ResolvedEvent,
            observed_at: DateTime<Utc>,
        ) -> Result<UpsertDisposition, StoreError> {
            let key = resolved.identity.key();
            if key == self.reject {
                return Err(StoreError::Write {
                    identity: key,
                    message: "value too long".into(),
                });
            }
            if self.unreachable_at == Some(key.as_str()) {
                return Err(StoreError::Connectivity("connection reset".into()));
            }
            if self.stalls_at == Some(key.as_str()) {
                return Err(StoreError::Timeout(std::time::Duration::from_secs(10)));
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

    #[test]
    fn duplicates_collapse_to_last_occurrence() {
        let batch = vec![
            resolved(EventCategory::Flare, json!({"flrID": "A", "classType": "C1"})),
            resolved(EventCategory::Flare, json!({"flrID": "B"})),
            resolved(EventCategory::Flare, json!({"flrID": "A", "classType": "M2"})),
        ];
        let collapsed = collapse_duplicates(batch);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].identity.key(), "flare::A");
        assert_eq!(collapsed[0].event.class_type.as_deref(), Some("M2"));
        assert_eq!(collapsed[1].identity.key(), "flare::B");
    }

    #[tokio::test]
    async fn repeated_ingest_converges_on_one_record() {
        let store = MemoryEventStore::new();
        let engine = UpsertEngine::new(Arc::new(store.clone()));
        let event = resolved(EventCategory::GeomagneticStorm, json!({"gstID": "G-1", "startTime": "2024-05-10T15:00Z"}));

        let first = engine.apply(vec![event.clone()], at(0)).await.unwrap();
        let second = engine.apply(vec![event.clone()], at(10)).await.unwrap();
        assert_eq!(first.inserted, 1);
        assert_eq!(second.updated, 1);

        let stored = store.get(&event.identity).await.unwrap().unwrap();
        assert_eq!(stored.first_seen_at, at(0));
        assert_eq!(stored.last_seen_at, at(10));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn write_failure_is_counted_and_batch_continues() {
        let inner = MemoryEventStore::new();
        let engine = UpsertEngine::new(Arc::new(PickyStore {
            inner: inner.clone(),
            reject: "flare::bad",
            unreachable_at: None,
            stalls_at: None,
        }));
        let batch = vec![
            resolved(EventCategory::Flare, json!({"flrID": "one"})),
            resolved(EventCategory::Flare, json!({"flrID": "bad"})),
            resolved(EventCategory::Flare, json!({"flrID": "two"})),
        ];

        let counts = engine.apply(batch, at(1)).await.unwrap();
        assert_eq!(counts.inserted, 2);
        assert_eq!(counts.write_failures, 1);
        assert_eq!(inner.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn connectivity_loss_aborts_with_partial_counts() {
        let inner = MemoryEventStore::new();
        let engine = UpsertEngine::new(Arc::new(PickyStore {
            inner: inner.clone(),
            reject: "",
            unreachable_at: Some("flare::two"),
            stalls_at: None,
        }));
        let batch = vec![
            resolved(EventCategory::Flare, json!({"flrID": "one"})),
            resolved(EventCategory::Flare, json!({"flrID": "two"})),
            resolved(EventCategory::Flare, json!({"flrID": "three"})),
        ];

        let aborted = engine.apply(batch, at(1)).await.unwrap_err();
        assert_eq!(aborted.partial.inserted, 1);
        assert!(aborted.source.is_connectivity());
        assert_eq!(inner.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn store_timeout_aborts_like_connectivity_loss() {
        let inner = MemoryEventStore::new();
        let engine = UpsertEngine::new(Arc::new(PickyStore {
            inner: inner.clone(),
            reject: "flare::bad",
            unreachable_at: None,
            stalls_at: Some("flare::three"),
        }));
        let batch = vec![
            resolved(EventCategory::Flare, json!({"flrID": "one"})),
            resolved(EventCategory::Flare, json!({"flrID": "bad"})),
            resolved(EventCategory::Flare, json!({"flrID": "three"})),
            resolved(EventCategory::Flare, json!({"flrID": "four"})),
        ];

        let aborted = engine.apply(batch, at(1)).await.unwrap_err();
        assert!(matches!(aborted.source, StoreError::Timeout(_)));
        assert_eq!(aborted.partial.inserted, 1);
        assert_eq!(aborted.partial.write_failures, 1);
        assert_eq!(inner.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn older_observation_reports_stale() {
        let store = MemoryEventStore::new();
        let engine = UpsertEngine::new(Arc::new(store.clone()));
        let newer = resolved(EventCategory::Flare, json!({"flrID": "F", "classType": "X1"}));
        let older = resolved(EventCategory::Flare, json!({"flrID": "F", "classType": "C1"}));

        engine.apply(vec![newer], at(30)).await.unwrap();
        let counts = engine.apply(vec![older.clone()], at(20)).await.unwrap();
        assert_eq!(counts.stale, 1);
        let stored = store.get(&older.identity).await.unwrap().unwrap();
        assert_eq!(stored.event.class_type.as_deref(), Some("X1"));
    }
}
