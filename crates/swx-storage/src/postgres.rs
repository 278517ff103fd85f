//! PostgreSQL-backed [`EventStore`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use swx_core::{
    unknown_occurred_at, EventCategory, EventIdentity, JsonMap, NormalizedEvent, ResolvedEvent, StoredEvent,
};
use tracing::info;

use crate::store::{EventStore, StoreConnector, StoreError, UpsertDisposition};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const UPSERT_SQL: &str = r#"
INSERT INTO space_weather_events (
    identity, category, local_id, occurred_at, source_location, class_type, note, link, payload,
    first_seen_at, last_seen_at, last_modified_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10, $10)
ON CONFLICT (identity) DO UPDATE SET
    category = EXCLUDED.category,
    local_id = EXCLUDED.local_id,
    occurred_at = CASE
        WHEN EXCLUDED.occurred_at = $11 THEN space_weather_events.occurred_at
        ELSE EXCLUDED.occurred_at
    END,
    source_location = COALESCE(EXCLUDED.source_location, space_weather_events.source_location),
    class_type = COALESCE(EXCLUDED.class_type, space_weather_events.class_type),
    note = COALESCE(EXCLUDED.note, space_weather_events.note),
    link = COALESCE(EXCLUDED.link, space_weather_events.link),
    payload = space_weather_events.payload || EXCLUDED.payload,
    last_seen_at = EXCLUDED.last_seen_at,
    last_modified_at = EXCLUDED.last_modified_at
WHERE space_weather_events.last_modified_at <= EXCLUDED.last_modified_at
RETURNING (xmax = 0) AS inserted
"#;

const SELECT_COLUMNS: &str = "identity, category, occurred_at, source_location, class_type, note, link, \
     payload, first_seen_at, last_seen_at, last_modified_at";

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub call_timeout: Duration,
}

impl PgStoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Map a driver error onto the store taxonomy. Transport, pool and
/// connection-class SQLSTATE errors are connectivity; everything else is
/// attributed to the single write that raised it.
pub fn classify_sqlx_error(err: sqlx::Error, identity: Option<&EventIdentity>) -> StoreError {
    let write = |message: String| match identity {
        Some(identity) => StoreError::Write {
            identity: identity.key(),
            message,
        },
        None => StoreError::Decode(message),
    };
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Connectivity(err.to_string()),
        sqlx::Error::Database(db) => {
            let connection_class = db
                .code()
                .map(|code| code.starts_with("08") || code.starts_with("57P"))
                .unwrap_or(false);
            if connection_class {
                StoreError::Connectivity(db.to_string())
            } else {
                write(db.to_string())
            }
        }
        other => write(other.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
    call_timeout: Duration,
}

impl PgEventStore {
    pub fn new(pool: PgPool, call_timeout: Duration) -> Self {
        Self { pool, call_timeout }
    }

    async fn timed<T, F>(&self, identity: Option<&EventIdentity>, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>> + Send,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(|err| classify_sqlx_error(err, identity)),
            Err(_) => Err(StoreError::Timeout(self.call_timeout)),
        }
    }
}

fn optional_text(row: &PgRow, column: &str) -> Result<Option<String>, sqlx::Error> {
    row.try_get::<Option<String>, _>(column)
}

fn row_to_stored(row: &PgRow) -> Result<StoredEvent, StoreError> {
    let decode = |err: sqlx::Error| StoreError::Decode(err.to_string());
    let identity: String = row.try_get("identity").map_err(decode)?;
    let identity: EventIdentity = identity
        .parse()
        .map_err(|err: swx_core::IdentityParseError| StoreError::Decode(err.to_string()))?;
    let category: String = row.try_get("category").map_err(decode)?;
    let category: EventCategory = category
        .parse()
        .map_err(|err: swx_core::UnknownCategory| StoreError::Decode(err.to_string()))?;
    let Json(payload): Json<JsonMap> = row.try_get("payload").map_err(decode)?;

    Ok(StoredEvent {
        identity,
        event: NormalizedEvent {
            category,
            occurred_at: row.try_get("occurred_at").map_err(decode)?,
            source_location: optional_text(row, "source_location").map_err(decode)?,
            class_type: optional_text(row, "class_type").map_err(decode)?,
            note: optional_text(row, "note").map_err(decode)?,
            link: optional_text(row, "link").map_err(decode)?,
            payload,
        },
        first_seen_at: row.try_get("first_seen_at").map_err(decode)?,
        last_seen_at: row.try_get("last_seen_at").map_err(decode)?,
        last_modified_at: row.try_get("last_modified_at").map_err(decode)?,
    })
}

fn clamp_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn upsert(
        &self,
        resolved: &ResolvedEvent,
        observed_at: DateTime<Utc>,
    ) -> Result<UpsertDisposition, StoreError> {
        let identity = &resolved.identity;
        let event = &resolved.event;
        let row = self
            .timed(
                Some(identity),
                sqlx::query(UPSERT_SQL)
                    .bind(identity.key())
                    .bind(event.category.slug())
                    .bind(identity.local_id())
                    .bind(event.occurred_at)
                    .bind(event.source_location.as_deref())
                    .bind(event.class_type.as_deref())
                    .bind(event.note.as_deref())
                    .bind(event.link.as_deref())
                    .bind(Json(&event.payload))
                    .bind(observed_at)
                    .bind(unknown_occurred_at())
                    .fetch_optional(&self.pool),
            )
            .await?;

        match row {
            None => Ok(UpsertDisposition::Stale),
            Some(row) => {
                let inserted: bool = row
                    .try_get("inserted")
                    .map_err(|err| classify_sqlx_error(err, Some(identity)))?;
                Ok(if inserted {
                    UpsertDisposition::Inserted
                } else {
                    UpsertDisposition::Updated
                })
            }
        }
    }

    async fn get(&self, identity: &EventIdentity) -> Result<Option<StoredEvent>, StoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM space_weather_events WHERE identity = $1");
        let row = self
            .timed(
                None,
                sqlx::query(&sql).bind(identity.key()).fetch_optional(&self.pool),
            )
            .await?;
        row.as_ref().map(row_to_stored).transpose()
    }

    async fn latest_by_category(
        &self,
        category: EventCategory,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM space_weather_events WHERE category = $1 \
             ORDER BY occurred_at DESC, identity ASC LIMIT $2"
        );
        let rows = self
            .timed(
                None,
                sqlx::query(&sql)
                    .bind(category.slug())
                    .bind(clamp_i64(limit))
                    .fetch_all(&self.pool),
            )
            .await?;
        rows.iter().map(row_to_stored).collect()
    }

    async fn page(&self, offset: usize, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM space_weather_events \
             ORDER BY occurred_at DESC, identity ASC OFFSET $1 LIMIT $2"
        );
        let rows = self
            .timed(
                None,
                sqlx::query(&sql)
                    .bind(clamp_i64(offset))
                    .bind(clamp_i64(limit))
                    .fetch_all(&self.pool),
            )
            .await?;
        rows.iter().map(row_to_stored).collect()
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .timed(
                None,
                sqlx::query_scalar("SELECT COUNT(*) FROM space_weather_events").fetch_one(&self.pool),
            )
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Builds a new pool per connect and applies the embedded schema.
#[derive(Debug, Clone)]
pub struct PgConnector {
    config: PgStoreConfig,
}

impl PgConnector {
    pub fn new(config: PgStoreConfig) -> Self {
        Self { config }
    }

    /// Pool creation and migration share one `call_timeout` budget; the
    /// migrator can otherwise wait forever on another process's advisory lock.
    pub async fn connect_store(&self) -> Result<PgEventStore, StoreError> {
        let pool = bounded(self.config.call_timeout, self.open_pool()).await?;
        info!(max_connections = self.config.max_connections, "event store connected");
        Ok(PgEventStore::new(pool, self.config.call_timeout))
    }
}

impl PgConnector {
    async fn open_pool(&self) -> Result<PgPool, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections.max(1))
            .acquire_timeout(self.config.acquire_timeout)
            .connect(&self.config.database_url)
            .await
            .map_err(|err| StoreError::Connectivity(err.to_string()))?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|err| StoreError::Schema(err.to_string()))?;
        Ok(pool)
    }
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(StoreError::Timeout(limit)))
}

#[async_trait]
impl StoreConnector for PgConnector {
    async fn connect(&self) -> Result<Arc<dyn EventStore>, StoreError> {
        Ok(Arc::new(self.connect_store().await?))
    }
}
