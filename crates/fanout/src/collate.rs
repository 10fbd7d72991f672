//! Collation: the store keeps one row per CRN, subscribers get one
//! notification per upstream record. Incident (BSPN) groups keep only the
//! most recent narration, and ServiceNow maintenances are deliberately not
//! collated at all.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use models::{Notification, NotificationType, TranslatedText};
use serde::Serialize;

/// One collated outbound notification: a representative row plus the CRN
/// union it speaks for.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub representative: Notification,
    pub crns: Vec<String>,
}

/// Collate the rows read back for one fan-out event. `rows` is ordered by
/// record id, which makes every choice below deterministic.
pub fn collate(rows: Vec<Notification>) -> Vec<Outbound> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };

    // ServiceNow maintenances are never collated; each row is delivered as
    // its own notification.
    if first.notification_type == NotificationType::Maintenance && first.source == "servicenow" {
        return rows
            .into_iter()
            .map(|row| Outbound {
                crns: vec![row.crn_full.clone()],
                representative: row,
            })
            .collect();
    }

    // Incident rows are BSPN-style: group by incident id and keep only the
    // newest narration of each incident.
    if first.notification_type == NotificationType::Incident {
        let mut by_incident: BTreeMap<String, Notification> = BTreeMap::new();
        for row in rows {
            let key = row
                .incident_id
                .clone()
                .unwrap_or_else(|| row.source_id.clone());
            match by_incident.get(&key) {
                Some(kept) if kept.pnp_update_time >= row.pnp_update_time => {}
                _ => {
                    by_incident.insert(key, row);
                }
            }
        }
        return by_incident
            .into_values()
            .map(|row| Outbound {
                crns: vec![row.crn_full.clone()],
                representative: row,
            })
            .collect();
    }

    // Everything else: one outbound per (source, source-id), the smallest
    // record id as representative, carrying the CRN union.
    let mut by_source_id: BTreeMap<(String, String), Outbound> = BTreeMap::new();
    for row in rows {
        let key = (row.source.clone(), row.source_id.clone());
        match by_source_id.get_mut(&key) {
            None => {
                by_source_id.insert(
                    key,
                    Outbound {
                        crns: vec![row.crn_full.clone()],
                        representative: row,
                    },
                );
            }
            Some(outbound) => {
                outbound.crns.push(row.crn_full.clone());
                if row.record_id < outbound.representative.record_id {
                    outbound.representative = row;
                }
            }
        }
    }
    by_source_id.into_values().collect()
}

/// Wire shape POSTed to subscribers: the representative row's fields with
/// the collated CRN list and the (possibly filtered) tags.
#[derive(Debug, Serialize)]
pub struct OutboundNotification {
    pub record_id: String,
    pub source: String,
    pub source_id: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub category: String,
    pub incident_id: String,
    pub crn_full: String,
    pub crns: Vec<String>,
    pub tags: Vec<String>,
    pub pnp_creation_time: String,
    pub pnp_update_time: String,
    pub source_creation_time: String,
    pub source_update_time: String,
    pub event_time_start: String,
    pub event_time_end: String,
    pub short_description: Vec<TranslatedText>,
    pub long_description: Vec<TranslatedText>,
    pub resource_display_names: Vec<TranslatedText>,
    pub pnp_removed: bool,
}

impl OutboundNotification {
    pub fn new(outbound: &Outbound, tags: Vec<String>) -> OutboundNotification {
        let n = &outbound.representative;
        OutboundNotification {
            record_id: n.record_id.to_string(),
            source: n.source.clone(),
            source_id: n.source_id.clone(),
            notification_type: n.notification_type,
            category: n.category.clone(),
            incident_id: n.incident_id.clone().unwrap_or_default(),
            crn_full: n.crn_full.clone(),
            crns: outbound.crns.clone(),
            tags,
            pnp_creation_time: rfc3339(Some(n.pnp_creation_time)),
            pnp_update_time: rfc3339(Some(n.pnp_update_time)),
            source_creation_time: rfc3339(n.source_creation_time),
            source_update_time: rfc3339(Some(n.source_update_time)),
            event_time_start: rfc3339(n.event_time_start),
            event_time_end: rfc3339(n.event_time_end),
            short_description: vec![TranslatedText::en(&n.short_description)],
            long_description: vec![TranslatedText::en(&n.long_description)],
            resource_display_names: n.resource_display_names.clone(),
            pnp_removed: n.pnp_removed,
        }
    }
}

fn rfc3339(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use models::RecordId;

    fn row(
        source: &str,
        source_id: &str,
        crn: &str,
        notification_type: NotificationType,
        pnp_update: &str,
    ) -> Notification {
        let at: DateTime<Utc> = "2025-01-01T10:00:00Z".parse().unwrap();
        Notification {
            record_id: RecordId::derive(source, source_id, crn),
            source: source.to_string(),
            source_id: source_id.to_string(),
            crn_full: crn.to_string(),
            notification_type,
            category: "services".to_string(),
            incident_id: None,
            short_description: "s".to_string(),
            long_description: "l".to_string(),
            event_time_start: None,
            event_time_end: None,
            source_creation_time: None,
            source_update_time: at,
            pnp_creation_time: at,
            pnp_update_time: pnp_update.parse().unwrap(),
            tags: vec![],
            resource_display_names: vec![],
            pnp_removed: false,
        }
    }

    fn sorted_by_record_id(mut rows: Vec<Notification>) -> Vec<Notification> {
        rows.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        rows
    }

    const CRN_A: &str = "crn:v1:bluemix:public:svc:us-south::::";
    const CRN_B: &str = "crn:v1:bluemix:public:svc:eu-gb::::";
    const CRN_C: &str = "crn:v1:bluemix:public:svc:au-syd::::";

    #[test]
    fn test_multi_crn_rows_collate_to_one() {
        let rows = sorted_by_record_id(vec![
            row("doctor", "M1", CRN_A, NotificationType::Announcement, "2025-01-01T10:00:00Z"),
            row("doctor", "M1", CRN_B, NotificationType::Announcement, "2025-01-01T10:00:00Z"),
            row("doctor", "M1", CRN_C, NotificationType::Announcement, "2025-01-01T10:00:00Z"),
        ]);
        let smallest = rows[0].record_id.clone();

        let out = collate(rows);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].crns.len(), 3);
        assert_eq!(out[0].representative.record_id, smallest);
    }

    #[test]
    fn test_servicenow_maintenance_is_never_collated() {
        let rows = vec![
            row("servicenow", "CHG7", CRN_A, NotificationType::Maintenance, "2025-01-01T10:00:00Z"),
            row("servicenow", "CHG7", CRN_B, NotificationType::Maintenance, "2025-01-01T10:00:00Z"),
        ];
        let out = collate(rows);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|o| o.crns.len() == 1));
    }

    #[test]
    fn test_doctor_maintenance_still_collates() {
        let rows = vec![
            row("doctor", "M1", CRN_A, NotificationType::Maintenance, "2025-01-01T10:00:00Z"),
            row("doctor", "M1", CRN_B, NotificationType::Maintenance, "2025-01-01T10:00:00Z"),
        ];
        assert_eq!(collate(rows).len(), 1);
    }

    #[test]
    fn test_bspn_recency_selection() {
        let mut a = row("servicenow", "BSPN1", CRN_A, NotificationType::Incident, "2025-01-01T10:00:00Z");
        let mut b = row("servicenow", "BSPN2", CRN_A, NotificationType::Incident, "2025-01-01T10:05:00Z");
        let mut c = row("servicenow", "BSPN3", CRN_A, NotificationType::Incident, "2025-01-01T10:07:00Z");
        for bspn in [&mut a, &mut b, &mut c] {
            bspn.incident_id = Some("INC001".to_string());
        }

        let out = collate(vec![a, b, c]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].representative.source_id, "BSPN3");
    }

    #[test]
    fn test_distinct_incidents_stay_separate() {
        let mut a = row("servicenow", "BSPN1", CRN_A, NotificationType::Incident, "2025-01-01T10:00:00Z");
        let mut b = row("servicenow", "BSPN2", CRN_B, NotificationType::Incident, "2025-01-01T10:05:00Z");
        a.incident_id = Some("INC001".to_string());
        b.incident_id = Some("INC002".to_string());

        assert_eq!(collate(vec![a, b]).len(), 2);
    }

    #[test]
    fn test_empty_input() {
        assert!(collate(vec![]).is_empty());
    }
}
