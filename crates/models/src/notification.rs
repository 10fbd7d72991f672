use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Display};
use std::str::FromStr;

use crate::message::TranslatedText;

/// RecordId is the internally-allocated identity of a persisted notification
/// row. It is derived from the externally-authoritative (source, source-id,
/// CRN) triple so that re-applying a message allocates the same id.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn derive(source: &str, source_id: &str, crn_full: &str) -> RecordId {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update(b":");
        hasher.update(source_id.as_bytes());
        hasher.update(b":");
        hasher.update(crn_full.as_bytes());
        RecordId(hex::encode(&hasher.finalize()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        RecordId(value)
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Security,
    Announcement,
    Incident,
    Maintenance,
}

impl Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            NotificationType::Security => "security",
            NotificationType::Announcement => "announcement",
            NotificationType::Incident => "incident",
            NotificationType::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

impl FromStr for NotificationType {
    type Err = UnknownType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "security" => Ok(NotificationType::Security),
            "announcement" => Ok(NotificationType::Announcement),
            "incident" => Ok(NotificationType::Incident),
            "maintenance" => Ok(NotificationType::Maintenance),
            other => Err(UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown notification type '{0}'")]
pub struct UnknownType(String);

/// Notification is the canonical unit flowing through the pipeline: one row
/// per (source, source-id, CRN). A single upstream record spanning N CRNs
/// persists as N rows sharing (source, source-id); fan-out collation
/// reverses this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub record_id: RecordId,
    pub source: String,
    pub source_id: String,
    pub crn_full: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub category: String,
    pub incident_id: Option<String>,
    pub short_description: String,
    pub long_description: String,
    pub event_time_start: Option<DateTime<Utc>>,
    pub event_time_end: Option<DateTime<Utc>>,
    pub source_creation_time: Option<DateTime<Utc>>,
    pub source_update_time: DateTime<Utc>,
    pub pnp_creation_time: DateTime<Utc>,
    pub pnp_update_time: DateTime<Utc>,
    /// Ordered; a leading `retract` tag suppresses the row from default queries.
    pub tags: Vec<String>,
    pub resource_display_names: Vec<TranslatedText>,
    /// Tombstone. Deleted rows are retained for late subscribers.
    pub pnp_removed: bool,
}

impl Notification {
    /// Hash over the content fields, used to decide whether a same-timestamp
    /// message is a genuine refresh. Pipeline-observed timestamps are
    /// excluded: they change on every write.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.category.as_str(),
            self.incident_id.as_deref().unwrap_or(""),
            self.short_description.as_str(),
            self.long_description.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        for time in [
            &self.event_time_start,
            &self.event_time_end,
            &self.source_creation_time,
        ] {
            hasher.update(time.map(|t| t.timestamp_micros()).unwrap_or(i64::MIN).to_be_bytes());
        }
        for tag in &self.tags {
            hasher.update(tag.as_bytes());
            hasher.update([0u8]);
        }
        for name in &self.resource_display_names {
            hasher.update(name.language.as_bytes());
            hasher.update([0u8]);
            hasher.update(name.name.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([self.pnp_removed as u8]);
        hex::encode(hasher.finalize())
    }

    /// Whether the row is hidden from default subscriber queries.
    pub fn is_retracted(&self) -> bool {
        self.tags.first().is_some_and(|tag| tag.starts_with("retract"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> Notification {
        let at = "2025-01-01T10:00:00Z".parse().unwrap();
        Notification {
            record_id: RecordId::derive("servicenow", "INC001", "crn:v1:bluemix:public:svc:us-south::::"),
            source: "servicenow".to_string(),
            source_id: "INC001".to_string(),
            crn_full: "crn:v1:bluemix:public:svc:us-south::::".to_string(),
            notification_type: NotificationType::Incident,
            category: "services".to_string(),
            incident_id: Some("INC001".to_string()),
            short_description: "down".to_string(),
            long_description: "the service is down".to_string(),
            event_time_start: Some(at),
            event_time_end: None,
            source_creation_time: Some(at),
            source_update_time: at,
            pnp_creation_time: at,
            pnp_update_time: at,
            tags: vec![],
            resource_display_names: vec![TranslatedText {
                name: "Service".to_string(),
                language: "en".to_string(),
            }],
            pnp_removed: false,
        }
    }

    #[test]
    fn test_record_id_is_deterministic() {
        let a = RecordId::derive("servicenow", "INC001", "crn:v1:bluemix:public:svc:us-south::::");
        let b = RecordId::derive("servicenow", "INC001", "crn:v1:bluemix:public:svc:us-south::::");
        let c = RecordId::derive("servicenow", "INC001", "crn:v1:bluemix:public:svc:eu-gb::::");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_content_hash_ignores_pipeline_timestamps() {
        let mut updated = fixture();
        updated.pnp_update_time = "2030-01-01T00:00:00Z".parse().unwrap();
        assert_eq!(fixture().content_hash(), updated.content_hash());

        updated.short_description = "still down".to_string();
        assert_ne!(fixture().content_hash(), updated.content_hash());
    }

    #[test]
    fn test_retract_tag_must_lead() {
        let mut n = fixture();
        assert!(!n.is_retracted());
        n.tags = vec!["retract-1".to_string()];
        assert!(n.is_retracted());
        n.tags = vec!["other".to_string(), "retract".to_string()];
        assert!(!n.is_retracted());
    }

    #[test]
    fn test_type_round_trip() {
        for t in ["security", "announcement", "incident", "maintenance"] {
            assert_eq!(t.parse::<NotificationType>().unwrap().to_string(), t);
        }
        assert!("problem".parse::<NotificationType>().is_err());
    }
}
