use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::notification::{Notification, NotificationType};

/// RawEnvelope wraps an opaque hook payload with its source and arrival
/// time. Bodies stay unparsed until an adapter normalizes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub source: String,
    pub received_at: DateTime<Utc>,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "bulkload")]
    BulkLoad,
    #[serde(rename = "update")]
    Update,
}

/// A translated display string, `{"name": ..., "language": ...}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatedText {
    pub name: String,
    pub language: String,
}

impl TranslatedText {
    pub fn en(name: impl Into<String>) -> TranslatedText {
        TranslatedText {
            name: name.into(),
            language: "en".to_string(),
        }
    }
}

/// IngestMessage is the typed message adapters publish for the NQ2DS
/// consumer: one upstream record, possibly spanning several CRNs. The
/// consumer expands it to one row per CRN inside a single transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestMessage {
    pub kind: ChangeKind,
    pub source: String,
    pub source_id: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub incident_id: Option<String>,
    pub crns: Vec<String>,
    #[serde(default)]
    pub short_description: String,
    #[serde(default)]
    pub long_description: String,
    #[serde(default)]
    pub event_time_start: Option<String>,
    #[serde(default)]
    pub event_time_end: Option<String>,
    #[serde(default)]
    pub source_creation_time: Option<String>,
    pub source_update_time: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub resource_display_names: Vec<TranslatedText>,
    #[serde(default)]
    pub pnp_removed: bool,
}

impl IngestMessage {
    /// Expand to one Notification per CRN. The pipeline-observed timestamps
    /// are seeded with `now`; the consumer adjusts them under its ordering
    /// rules. An unparseable CRN rejects the whole message.
    pub fn to_notifications(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Notification>, crate::CrnError> {
        let source_update_time = crate::normalize(&self.source_update_time).unwrap_or(now);
        let source_creation_time = self
            .source_creation_time
            .as_deref()
            .and_then(crate::normalize);
        let event_time_start = self.event_time_start.as_deref().and_then(crate::normalize);
        let event_time_end = self.event_time_end.as_deref().and_then(crate::normalize);

        let mut notifications = Vec::with_capacity(self.crns.len());
        for crn_full in &self.crns {
            let _ = crn_full.parse::<crate::Crn>()?;

            notifications.push(Notification {
                record_id: crate::RecordId::derive(&self.source, &self.source_id, crn_full),
                source: self.source.clone(),
                source_id: self.source_id.clone(),
                crn_full: crn_full.clone(),
                notification_type: self.notification_type,
                category: self.category.clone(),
                incident_id: self.incident_id.clone(),
                short_description: self.short_description.clone(),
                long_description: self.long_description.clone(),
                event_time_start,
                event_time_end,
                source_creation_time,
                source_update_time,
                pnp_creation_time: now,
                pnp_update_time: now,
                tags: self.tags.clone(),
                resource_display_names: self.resource_display_names.clone(),
                pnp_removed: self.pnp_removed,
            });
        }
        Ok(notifications)
    }
}

/// FanoutMessage is the downstream event emitted after a non-no-op commit,
/// consumed by the subscription fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutMessage {
    pub msgtype: ChangeKind,
    pub record_id: String,
    pub source: String,
    pub source_id: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub category: String,
    #[serde(default)]
    pub incident_id: String,
    pub crn_full: String,
    /// Comma-joined, order preserved.
    pub tags: String,
    pub pnp_creation_time: String,
    pub pnp_update_time: String,
    #[serde(default)]
    pub source_creation_time: String,
    pub source_update_time: String,
    #[serde(default)]
    pub event_time_start: String,
    #[serde(default)]
    pub event_time_end: String,
    pub short_description: Vec<TranslatedText>,
    pub long_description: Vec<TranslatedText>,
    pub resource_display_names: Vec<TranslatedText>,
    pub pnp_removed: bool,
}

impl FanoutMessage {
    pub fn from_notification(notification: &Notification, msgtype: ChangeKind) -> FanoutMessage {
        FanoutMessage {
            msgtype,
            record_id: notification.record_id.to_string(),
            source: notification.source.clone(),
            source_id: notification.source_id.clone(),
            notification_type: notification.notification_type,
            category: notification.category.clone(),
            incident_id: notification.incident_id.clone().unwrap_or_default(),
            crn_full: notification.crn_full.clone(),
            tags: notification.tags.join(","),
            pnp_creation_time: rfc3339(Some(notification.pnp_creation_time)),
            pnp_update_time: rfc3339(Some(notification.pnp_update_time)),
            source_creation_time: rfc3339(notification.source_creation_time),
            source_update_time: rfc3339(Some(notification.source_update_time)),
            event_time_start: rfc3339(notification.event_time_start),
            event_time_end: rfc3339(notification.event_time_end),
            short_description: vec![TranslatedText::en(&notification.short_description)],
            long_description: vec![TranslatedText::en(&notification.long_description)],
            resource_display_names: notification.resource_display_names.clone(),
            pnp_removed: notification.pnp_removed,
        }
    }
}

fn rfc3339(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::notification::RecordId;

    #[test]
    fn test_raw_envelope_round_trip() {
        let envelope = RawEnvelope {
            source: "servicenow".to_string(),
            received_at: "2025-01-01T10:00:00Z".parse().unwrap(),
            body: b"{\"number\": \"INC001\"}".to_vec(),
        };
        let encoded = serde_json::to_string(&envelope).unwrap();
        assert!(encoded.contains("eyJudW1iZXIiOiAiSU5DMDAxIn0="));
        let decoded: RawEnvelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_fanout_message_wire_shape() {
        let at = "2025-01-01T10:00:00Z".parse().unwrap();
        let notification = Notification {
            record_id: RecordId::derive("servicenow", "INC001", "crn:v1:bluemix:public:svc:us-south::::"),
            source: "servicenow".to_string(),
            source_id: "INC001".to_string(),
            crn_full: "crn:v1:bluemix:public:svc:us-south::::".to_string(),
            notification_type: NotificationType::Incident,
            category: "services".to_string(),
            incident_id: None,
            short_description: "down".to_string(),
            long_description: "the service is down".to_string(),
            event_time_start: Some(at),
            event_time_end: None,
            source_creation_time: None,
            source_update_time: at,
            pnp_creation_time: at,
            pnp_update_time: at,
            tags: vec!["t1".to_string(), "t2".to_string()],
            resource_display_names: vec![TranslatedText::en("Service")],
            pnp_removed: false,
        };

        let message = FanoutMessage::from_notification(&notification, ChangeKind::Update);
        insta::assert_json_snapshot!(message, {".record_id" => "[record_id]"}, @r###"
        {
          "msgtype": "update",
          "record_id": "[record_id]",
          "source": "servicenow",
          "source_id": "INC001",
          "type": "incident",
          "category": "services",
          "incident_id": "",
          "crn_full": "crn:v1:bluemix:public:svc:us-south::::",
          "tags": "t1,t2",
          "pnp_creation_time": "2025-01-01T10:00:00Z",
          "pnp_update_time": "2025-01-01T10:00:00Z",
          "source_creation_time": "",
          "source_update_time": "2025-01-01T10:00:00Z",
          "event_time_start": "2025-01-01T10:00:00Z",
          "event_time_end": "",
          "short_description": [
            {
              "name": "down",
              "language": "en"
            }
          ],
          "long_description": [
            {
              "name": "the service is down",
              "language": "en"
            }
          ],
          "resource_display_names": [
            {
              "name": "Service",
              "language": "en"
            }
          ],
          "pnp_removed": false
        }
        "###);
    }

    #[test]
    fn test_ingest_message_expands_per_crn() {
        let message = IngestMessage {
            kind: ChangeKind::Update,
            source: "servicenow".to_string(),
            source_id: "INC001".to_string(),
            notification_type: NotificationType::Incident,
            category: "services".to_string(),
            incident_id: Some("INC001".to_string()),
            crns: vec![
                "crn:v1:bluemix:public:svc:us-south::::".to_string(),
                "crn:v1:bluemix:public:svc:eu-gb::::".to_string(),
            ],
            short_description: "down".to_string(),
            long_description: "".to_string(),
            event_time_start: None,
            event_time_end: None,
            source_creation_time: Some("2025-01-01 09:00:00Z".to_string()),
            source_update_time: "2025-01-01T10:00:00Z".to_string(),
            tags: vec![],
            resource_display_names: vec![],
            pnp_removed: false,
        };
        let now = "2025-01-01T10:05:00Z".parse().unwrap();

        let rows = message.to_notifications(now).unwrap();
        assert_eq!(rows.len(), 2);
        assert_ne!(rows[0].record_id, rows[1].record_id);
        assert_eq!(
            rows[0].source_update_time,
            "2025-01-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(
            rows[0].source_creation_time,
            Some("2025-01-01T09:00:00Z".parse::<DateTime<Utc>>().unwrap())
        );
        assert_eq!(rows[0].pnp_creation_time, now);

        let mut bad_crn = message.clone();
        bad_crn.crns.push("not-a-crn".to_string());
        assert!(bad_crn.to_notifications(now).is_err());
    }

    #[test]
    fn test_change_kind_wire_names() {
        assert_eq!(serde_json::to_string(&ChangeKind::BulkLoad).unwrap(), "\"bulkload\"");
        assert_eq!(serde_json::to_string(&ChangeKind::Update).unwrap(), "\"update\"");
    }
}
