//! Stable identity derivation for raw reports.
//!
//! Changing any table here re-keys already-stored events and splits their
//! history, so the candidate order is fixed and covered by tests.

use crate::normalize::resolve_occurred_at;
use crate::{iso_seconds, EventCategory, EventIdentity, RawEvent};

const FLARE_ID_FIELDS: [&str; 4] = ["flrID", "activityID", "eventID", "id"];
const CME_ID_FIELDS: [&str; 3] = ["activityID", "eventID", "id"];
const GST_ID_FIELDS: [&str; 4] = ["gstID", "activityID", "eventID", "id"];
const IPS_ID_FIELDS: [&str; 3] = ["activityID", "eventID", "id"];
const MPC_ID_FIELDS: [&str; 4] = ["mpcID", "activityID", "eventID", "id"];

pub const LINK_FIELD: &str = "link";
pub const SYNTHETIC_PREFIX: &str = "unknown-";

/// Candidate ID fields, category-specific field first, then the generic chain.
pub fn id_fields(category: EventCategory) -> &'static [&'static str] {
    match category {
        EventCategory::Flare => &FLARE_ID_FIELDS,
        EventCategory::CoronalMassEjection => &CME_ID_FIELDS,
        EventCategory::GeomagneticStorm => &GST_ID_FIELDS,
        EventCategory::InterplanetaryShock => &IPS_ID_FIELDS,
        EventCategory::MagnetopauseCrossing => &MPC_ID_FIELDS,
    }
}

/// Derive `{category}::{local_id}` from category and payload alone.
///
/// Reports with neither an ID field nor a link get a synthetic
/// `unknown-<occurred_at>` local ID. Two distinct reports that both land on the
/// same synthetic value are merged into one record; that is an accepted
/// limitation of feed entries that carry nothing identifying.
pub fn resolve_identity(raw: &RawEvent) -> EventIdentity {
    let local_id = id_fields(raw.category)
        .iter()
        .find_map(|key| raw.text_field(key))
        .or_else(|| raw.text_field(LINK_FIELD))
        .unwrap_or_else(|| format!("{SYNTHETIC_PREFIX}{}", iso_seconds(resolve_occurred_at(raw))));
    EventIdentity::new(raw.category, local_id)
}

pub fn is_synthetic(identity: &EventIdentity) -> bool {
    identity.local_id().starts_with(SYNTHETIC_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(category: EventCategory, value: serde_json::Value) -> RawEvent {
        RawEvent::new(category, value.as_object().cloned().expect("object"))
    }

    #[test]
    fn id_field_order_is_pinned() {
        assert_eq!(id_fields(EventCategory::Flare), ["flrID", "activityID", "eventID", "id"]);
        assert_eq!(id_fields(EventCategory::CoronalMassEjection), ["activityID", "eventID", "id"]);
        assert_eq!(id_fields(EventCategory::GeomagneticStorm), ["gstID", "activityID", "eventID", "id"]);
        assert_eq!(id_fields(EventCategory::InterplanetaryShock), ["activityID", "eventID", "id"]);
        assert_eq!(id_fields(EventCategory::MagnetopauseCrossing), ["mpcID", "activityID", "eventID", "id"]);
    }

    #[test]
    fn category_specific_field_wins() {
        let identity = resolve_identity(&raw(
            EventCategory::Flare,
            json!({"id": 7, "activityID": "ACT", "flrID": "FL-1", "link": "https://x"}),
        ));
        assert_eq!(identity.key(), "flare::FL-1");
    }

    #[test]
    fn generic_chain_used_in_order() {
        let identity = resolve_identity(&raw(
            EventCategory::MagnetopauseCrossing,
            json!({"id": "generic", "eventID": "EV-3"}),
        ));
        assert_eq!(identity.key(), "magnetopause-crossing::EV-3");

        let identity = resolve_identity(&raw(EventCategory::MagnetopauseCrossing, json!({"id": 991})));
        assert_eq!(identity.key(), "magnetopause-crossing::991");
    }

    #[test]
    fn empty_and_null_ids_are_skipped() {
        let identity = resolve_identity(&raw(
            EventCategory::GeomagneticStorm,
            json!({"gstID": "", "activityID": null, "eventID": "  ", "id": "GST-fallback"}),
        ));
        assert_eq!(identity.local_id(), "GST-fallback");
    }

    #[test]
    fn link_is_the_last_real_fallback() {
        let identity = resolve_identity(&raw(
            EventCategory::CoronalMassEjection,
            json!({"startTime": "2024-01-01T00:00Z", "link": "https://feed/view/CME/1/-1"}),
        ));
        assert_eq!(identity.key(), "coronal-mass-ejection::https://feed/view/CME/1/-1");
        assert!(!is_synthetic(&identity));
    }

    #[test]
    fn nothing_identifying_yields_synthetic_time_key() {
        let identity = resolve_identity(&raw(
            EventCategory::InterplanetaryShock,
            json!({"eventTime": "2024-05-10T16:36Z", "location": "Earth"}),
        ));
        assert_eq!(identity.key(), "interplanetary-shock::unknown-2024-05-10T16:36:00Z");
        assert!(is_synthetic(&identity));

        let identity = resolve_identity(&raw(EventCategory::Flare, json!({})));
        assert_eq!(identity.key(), "flare::unknown-0001-01-01T00:00:00Z");
    }

    #[test]
    fn resolution_is_deterministic_across_revisions() {
        let first = raw(
            EventCategory::Flare,
            json!({"flrID": "FL-1", "beginTime": "2024-01-01T00:00Z"}),
        );
        let revised = raw(
            EventCategory::Flare,
            json!({
                "flrID": "FL-1",
                "beginTime": "2024-01-01T00:00Z",
                "peakTime": "2024-01-01T00:10Z",
                "classType": "X1.0",
            }),
        );
        assert_eq!(resolve_identity(&first), resolve_identity(&first));
        assert_eq!(resolve_identity(&first), resolve_identity(&revised));
    }

    #[test]
    fn same_local_id_in_two_categories_stays_distinct() {
        let a = resolve_identity(&raw(EventCategory::CoronalMassEjection, json!({"activityID": "123"})));
        let b = resolve_identity(&raw(EventCategory::InterplanetaryShock, json!({"activityID": "123"})));
        assert_eq!(a.local_id(), b.local_id());
        assert_ne!(a, b);
        assert_eq!(a.key(), "coronal-mass-ejection::123");
        assert_eq!(b.key(), "interplanetary-shock::123");
    }
}
