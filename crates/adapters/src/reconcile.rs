//! Snapshot-vs-store diffing. Pure: the scheduler feeds it a fresh upstream
//! snapshot and the persisted rows, and publishes whatever comes back.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, SecondsFormat, Utc};
use models::{ChangeKind, IngestMessage, TranslatedText};
use pnp_sql::NotificationRow;

/// Compute the messages a tick should publish. An empty store means this
/// source has never been loaded: everything goes out as a bulk-load.
/// Otherwise each snapshot element is compared by (source-id, CRN) and
/// emitted only when new or changed, and stored rows missing from the
/// snapshot come back as tombstone-setting updates.
pub fn diff(
    snapshot: &[IngestMessage],
    stored: &[NotificationRow],
    now: DateTime<Utc>,
) -> Vec<IngestMessage> {
    if stored.is_empty() {
        return snapshot
            .iter()
            .cloned()
            .map(|mut message| {
                message.kind = ChangeKind::BulkLoad;
                message
            })
            .collect();
    }

    let by_key: HashMap<(&str, &str), &NotificationRow> = stored
        .iter()
        .map(|row| ((row.source_id.as_str(), row.crn_full.as_str()), row))
        .collect();

    let mut out = Vec::new();
    let mut seen: HashSet<(&str, &str)> = HashSet::new();

    for element in snapshot {
        let rows = match element.to_notifications(now) {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(source_id = %element.source_id, %error, "skipping unparseable snapshot element");
                continue;
            }
        };
        for crn in &element.crns {
            seen.insert((element.source_id.as_str(), crn.as_str()));
        }

        let changed = rows.iter().any(|row| {
            match by_key.get(&(row.source_id.as_str(), row.crn_full.as_str())) {
                None => true,
                Some(stored_row) => stored_row.record_hash != row.content_hash(),
            }
        });
        if changed {
            let mut message = element.clone();
            message.kind = ChangeKind::Update;
            out.push(message);
        }
    }

    // Stored rows the snapshot no longer carries become tombstones, grouped
    // back into one message per source-id.
    let mut missing: BTreeMap<&str, Vec<&NotificationRow>> = BTreeMap::new();
    for row in stored {
        if row.pnp_removed || seen.contains(&(row.source_id.as_str(), row.crn_full.as_str())) {
            continue;
        }
        missing.entry(row.source_id.as_str()).or_default().push(row);
    }
    for rows in missing.into_values() {
        out.push(tombstone_message(rows, now));
    }
    out
}

fn tombstone_message(rows: Vec<&NotificationRow>, now: DateTime<Utc>) -> IngestMessage {
    let first = rows[0];
    IngestMessage {
        kind: ChangeKind::Update,
        source: first.source.clone(),
        source_id: first.source_id.clone(),
        notification_type: first
            .notification_type
            .parse()
            .unwrap_or(models::NotificationType::Maintenance),
        category: first.category.clone(),
        incident_id: first.incident_id.clone(),
        crns: rows.iter().map(|row| row.crn_full.clone()).collect(),
        short_description: first.short_description.clone(),
        long_description: first.long_description.clone(),
        event_time_start: first.event_time_start.map(rfc3339),
        event_time_end: first.event_time_end.map(rfc3339),
        source_creation_time: first.source_creation_time.map(rfc3339),
        // The disappearance is itself an update observed now.
        source_update_time: rfc3339(now),
        tags: pnp_sql::notifications::split_tags(&first.tags),
        resource_display_names: display_names(first),
        pnp_removed: true,
    }
}

fn display_names(row: &NotificationRow) -> Vec<TranslatedText> {
    row.resource_display_names.0.clone()
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod test {
    use super::*;
    use models::NotificationType;

    fn element(source_id: &str, crns: &[&str], description: &str) -> IngestMessage {
        IngestMessage {
            kind: ChangeKind::Update,
            source: "doctor".to_string(),
            source_id: source_id.to_string(),
            notification_type: NotificationType::Maintenance,
            category: "runtimes".to_string(),
            incident_id: None,
            crns: crns.iter().map(|crn| crn.to_string()).collect(),
            short_description: description.to_string(),
            long_description: String::new(),
            event_time_start: None,
            event_time_end: None,
            source_creation_time: None,
            source_update_time: "2025-01-01T10:00:00Z".to_string(),
            tags: vec![],
            resource_display_names: vec![],
            pnp_removed: false,
        }
    }

    fn stored(message: &IngestMessage, now: DateTime<Utc>) -> Vec<NotificationRow> {
        message
            .to_notifications(now)
            .unwrap()
            .iter()
            .map(NotificationRow::from_notification)
            .collect()
    }

    const CRN_US: &str = "crn:v1:bluemix:public:svc:us-south::::";
    const CRN_EU: &str = "crn:v1:bluemix:public:svc:eu-gb::::";

    fn now() -> DateTime<Utc> {
        "2025-01-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_empty_store_bulk_loads_everything() {
        let snapshot = vec![element("M1", &[CRN_US], "a"), element("M2", &[CRN_EU], "b")];
        let out = diff(&snapshot, &[], now());
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| m.kind == ChangeKind::BulkLoad));
    }

    #[test]
    fn test_unchanged_elements_are_quiet() {
        let snapshot = vec![element("M1", &[CRN_US, CRN_EU], "a")];
        let rows = stored(&snapshot[0], now());
        assert!(diff(&snapshot, &rows, now()).is_empty());
    }

    #[test]
    fn test_new_and_changed_elements_are_updates() {
        let old = element("M1", &[CRN_US], "a");
        let rows = stored(&old, now());

        let mut changed = old.clone();
        changed.short_description = "a, revised".to_string();
        let snapshot = vec![changed, element("M2", &[CRN_EU], "b")];

        let out = diff(&snapshot, &rows, now());
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| m.kind == ChangeKind::Update));
        assert!(out.iter().any(|m| m.source_id == "M1"));
        assert!(out.iter().any(|m| m.source_id == "M2"));
    }

    #[test]
    fn test_missing_elements_become_tombstones() {
        let gone = element("M1", &[CRN_US, CRN_EU], "a");
        let rows = stored(&gone, now());

        let out = diff(&[], &rows, now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, ChangeKind::Update);
        assert!(out[0].pnp_removed);
        assert_eq!(out[0].source_id, "M1");
        assert_eq!(out[0].crns.len(), 2);
    }

    #[test]
    fn test_already_tombstoned_rows_stay_quiet() {
        let gone = element("M1", &[CRN_US], "a");
        let mut rows = stored(&gone, now());
        rows[0].pnp_removed = true;

        assert!(diff(&[], &rows, now()).is_empty());
    }

    #[test]
    fn test_snapshot_growing_a_crn_is_an_update() {
        let old = element("M1", &[CRN_US], "a");
        let rows = stored(&old, now());
        let snapshot = vec![element("M1", &[CRN_US, CRN_EU], "a")];

        let out = diff(&snapshot, &rows, now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].crns.len(), 2);
    }
}
