//! Category-aware projection of raw feed payloads onto [`NormalizedEvent`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::{unknown_occurred_at, EventCategory, NormalizedEvent, RawEvent};

/// Time fields in priority order. The first one that is present and parses wins.
pub const TIME_FIELDS: [&str; 3] = ["beginTime", "startTime", "eventTime"];

/// Ordered source fields for each canonical slot of one category.
#[derive(Debug, Clone, Copy)]
pub struct FieldTable {
    pub time: &'static [&'static str],
    pub source_location: &'static [&'static str],
    pub class_type: &'static [&'static str],
    pub note: &'static [&'static str],
    pub link: &'static [&'static str],
}

const FLARE_FIELDS: FieldTable = FieldTable {
    time: &TIME_FIELDS,
    source_location: &["sourceLocation"],
    class_type: &["classType"],
    note: &["note"],
    link: &["link"],
};

const CME_FIELDS: FieldTable = FieldTable {
    time: &TIME_FIELDS,
    source_location: &["sourceLocation"],
    class_type: &[],
    note: &["note"],
    link: &["link"],
};

const GST_FIELDS: FieldTable = FieldTable {
    time: &TIME_FIELDS,
    source_location: &[],
    class_type: &[],
    note: &["note"],
    link: &["link"],
};

const IPS_FIELDS: FieldTable = FieldTable {
    time: &TIME_FIELDS,
    source_location: &["location"],
    class_type: &[],
    note: &["note"],
    link: &["link"],
};

const MPC_FIELDS: FieldTable = FieldTable {
    time: &TIME_FIELDS,
    source_location: &[],
    class_type: &[],
    note: &["note"],
    link: &["link"],
};

pub fn field_table(category: EventCategory) -> &'static FieldTable {
    match category {
        EventCategory::Flare => &FLARE_FIELDS,
        EventCategory::CoronalMassEjection => &CME_FIELDS,
        EventCategory::GeomagneticStorm => &GST_FIELDS,
        EventCategory::InterplanetaryShock => &IPS_FIELDS,
        EventCategory::MagnetopauseCrossing => &MPC_FIELDS,
    }
}

/// Parse the feed's timestamp spellings.
///
/// The feed mostly emits minute precision without seconds (`2024-01-01T00:10Z`),
/// which RFC 3339 parsing rejects, so a few explicit layouts are tried after it.
/// Values without an offset are taken as UTC.
pub fn parse_feed_time(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    const LAYOUTS: [&str; 5] = [
        "%Y-%m-%dT%H:%MZ",
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];
    for layout in LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, layout) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn first_text(raw: &RawEvent, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|key| raw.text_field(key))
}

/// `occurred_at` for a raw report, falling back to [`unknown_occurred_at`].
pub fn resolve_occurred_at(raw: &RawEvent) -> DateTime<Utc> {
    field_table(raw.category)
        .time
        .iter()
        .filter_map(|key| raw.text_field(key))
        .find_map(|value| parse_feed_time(&value))
        .unwrap_or_else(unknown_occurred_at)
}

/// Project a raw report onto the canonical record. Never fails.
pub fn normalize_event(raw: RawEvent) -> NormalizedEvent {
    let table = field_table(raw.category);
    NormalizedEvent {
        category: raw.category,
        occurred_at: resolve_occurred_at(&raw),
        source_location: first_text(&raw, table.source_location),
        class_type: first_text(&raw, table.class_type),
        note: first_text(&raw, table.note),
        link: first_text(&raw, table.link),
        payload: raw.payload,
    }
}
