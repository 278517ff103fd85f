//! Core domain model for space-weather event ingestion.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod identity;
pub mod normalize;

pub use identity::resolve_identity;
pub use normalize::{normalize_event, parse_feed_time};

pub const CRATE_NAME: &str = "swx-core";

pub type JsonMap = serde_json::Map<String, JsonValue>;

/// Seconds from the Unix epoch to `0001-01-01T00:00:00Z`.
const UNKNOWN_OCCURRED_AT_SECS: i64 = -62_135_596_800;

/// Sentinel used when a report carries no usable time field.
///
/// It is the earliest representable calendar instant the store accepts, so a
/// descending sort by `occurred_at` always places unknown-time events last.
pub fn unknown_occurred_at() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(UNKNOWN_OCCURRED_AT_SECS, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Report kinds published by the feed, one endpoint each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventCategory {
    Flare,
    CoronalMassEjection,
    GeomagneticStorm,
    InterplanetaryShock,
    MagnetopauseCrossing,
}

impl EventCategory {
    pub const ALL: [EventCategory; 5] = [
        EventCategory::Flare,
        EventCategory::CoronalMassEjection,
        EventCategory::GeomagneticStorm,
        EventCategory::InterplanetaryShock,
        EventCategory::MagnetopauseCrossing,
    ];

    /// Stable slug used as the identity prefix and the `category` column.
    pub fn slug(self) -> &'static str {
        match self {
            EventCategory::Flare => "flare",
            EventCategory::CoronalMassEjection => "coronal-mass-ejection",
            EventCategory::GeomagneticStorm => "geomagnetic-storm",
            EventCategory::InterplanetaryShock => "interplanetary-shock",
            EventCategory::MagnetopauseCrossing => "magnetopause-crossing",
        }
    }

    /// Path segment of the upstream endpoint.
    pub fn feed_code(self) -> &'static str {
        match self {
            EventCategory::Flare => "FLR",
            EventCategory::CoronalMassEjection => "CME",
            EventCategory::GeomagneticStorm => "GST",
            EventCategory::InterplanetaryShock => "IPS",
            EventCategory::MagnetopauseCrossing => "MPC",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event category `{0}`")]
pub struct UnknownCategory(pub String);

impl FromStr for EventCategory {
    type Err = UnknownCategory;

    /// Accepts either the slug (`flare`) or the feed code (`FLR`), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        EventCategory::ALL
            .into_iter()
            .find(|c| c.slug().eq_ignore_ascii_case(needle) || c.feed_code().eq_ignore_ascii_case(needle))
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// One entry from a category endpoint, stamped with the category that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub category: EventCategory,
    pub payload: JsonMap,
}

impl RawEvent {
    pub fn new(category: EventCategory, payload: JsonMap) -> Self {
        Self { category, payload }
    }

    /// Field rendered as text if it holds a non-empty string or a number.
    pub fn text_field(&self, key: &str) -> Option<String> {
        self.payload.get(key).and_then(json_text)
    }
}

pub(crate) fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if s.trim().is_empty() => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Canonical projection of a report. Fields the projection does not cover stay in `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub category: EventCategory,
    pub occurred_at: DateTime<Utc>,
    pub source_location: Option<String>,
    pub class_type: Option<String>,
    pub note: Option<String>,
    pub link: Option<String>,
    pub payload: JsonMap,
}

impl NormalizedEvent {
    pub fn has_known_time(&self) -> bool {
        self.occurred_at != unknown_occurred_at()
    }

    /// Overlay a later sighting of the same report. Slots and payload keys the
    /// incoming report carries replace the stored ones; the rest are kept.
    pub fn merge_from(&mut self, incoming: &NormalizedEvent) {
        self.category = incoming.category;
        if incoming.has_known_time() {
            self.occurred_at = incoming.occurred_at;
        }
        for (slot, value) in [
            (&mut self.source_location, &incoming.source_location),
            (&mut self.class_type, &incoming.class_type),
            (&mut self.note, &incoming.note),
            (&mut self.link, &incoming.link),
        ] {
            if value.is_some() {
                *slot = value.clone();
            }
        }
        for (key, value) in &incoming.payload {
            self.payload.insert(key.clone(), value.clone());
        }
    }
}

/// Deduplication key `{category}::{local_id}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct EventIdentity {
    category: EventCategory,
    local_id: String,
}

impl EventIdentity {
    pub const SEPARATOR: &'static str = "::";

    pub fn new(category: EventCategory, local_id: impl Into<String>) -> Self {
        Self {
            category,
            local_id: local_id.into(),
        }
    }

    pub fn category(&self) -> EventCategory {
        self.category
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EventIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.category.slug(), Self::SEPARATOR, self.local_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityParseError {
    #[error("identity `{0}` has no `::` separator")]
    MissingSeparator(String),
    #[error(transparent)]
    Category(#[from] UnknownCategory),
}

impl FromStr for EventIdentity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (category, local_id) = s
            .split_once(Self::SEPARATOR)
            .ok_or_else(|| IdentityParseError::MissingSeparator(s.to_string()))?;
        Ok(Self::new(category.parse()?, local_id))
    }
}

impl From<EventIdentity> for String {
    fn from(identity: EventIdentity) -> Self {
        identity.to_string()
    }
}

impl TryFrom<String> for EventIdentity {
    type Error = IdentityParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Handoff from the resolver stage into the upsert engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEvent {
    pub identity: EventIdentity,
    pub event: NormalizedEvent,
}

impl ResolvedEvent {
    /// Resolve identity from the untouched payload, then normalize.
    pub fn from_raw(raw: RawEvent) -> Self {
        let identity = resolve_identity(&raw);
        let event = normalize_event(raw);
        Self { identity, event }
    }
}

/// Persisted record. Written only by the upsert engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub identity: EventIdentity,
    #[serde(flatten)]
    pub event: NormalizedEvent,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

/// Inclusive calendar-date range requested from every category endpoint in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl FetchWindow {
    /// `(startDate, endDate)` in the feed's `YYYY-MM-DD` form.
    pub fn query_dates(&self) -> (String, String) {
        (
            self.start.format("%Y-%m-%d").to_string(),
            self.end.format("%Y-%m-%d").to_string(),
        )
    }
}

/// RFC 3339 with whole seconds and a `Z` suffix, the form used in synthetic identities.
pub fn iso_seconds(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
