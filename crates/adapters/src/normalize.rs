//! Normalizers for raw hook payloads. One parser per source shape; all of
//! them produce the typed message the NQ2DS consumer understands. Payload
//! fields stay opaque to the ingress; this is the first point where they
//! are given a schema.

use anyhow::Context;
use models::{ChangeKind, IngestMessage, NotificationType, RawEnvelope};
use serde::Deserialize;

/// Map one raw envelope, delivered under `topic`, to a typed message.
pub fn normalize_raw(topic: &str, envelope: &RawEnvelope) -> anyhow::Result<IngestMessage> {
    match topic {
        bus::topic::MAINTENANCE => doctor_maintenance(envelope),
        bus::topic::INCIDENT => snow_incident(envelope),
        bus::topic::CASE => snow_case(envelope),
        bus::topic::CHANGE => snow_change(envelope),
        bus::topic::ANNOUNCEMENT => ghe_announcement(envelope),
        other => anyhow::bail!("no normalizer for topic '{other}'"),
    }
}

/// Either a single CRN or a list; sources disagree.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CrnField {
    One(String),
    Many(Vec<String>),
}

impl Default for CrnField {
    fn default() -> Self {
        CrnField::Many(Vec::new())
    }
}

impl CrnField {
    fn into_vec(self) -> Vec<String> {
        match self {
            CrnField::One(crn) => vec![crn],
            CrnField::Many(crns) => crns,
        }
    }
}

/// ServiceNow timestamps arrive naive (`yyyy-MM-dd HH:mm:ss`) and are UTC;
/// tag them so the canonicalizer can parse them.
fn snow_time(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if models::normalize(raw).is_some() {
        return Some(raw.to_string());
    }
    Some(format!("{raw}Z"))
}

fn doctor_maintenance(envelope: &RawEnvelope) -> anyhow::Result<IngestMessage> {
    #[derive(Deserialize)]
    struct Payload {
        id: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        category: String,
        #[serde(default)]
        crns: CrnField,
        #[serde(default)]
        planned_start: Option<String>,
        #[serde(default)]
        planned_end: Option<String>,
        #[serde(default)]
        created: Option<String>,
        updated: String,
        #[serde(default)]
        tags: Vec<String>,
    }

    let payload: Payload =
        serde_json::from_slice(&envelope.body).context("parsing doctor maintenance payload")?;

    Ok(IngestMessage {
        kind: ChangeKind::Update,
        source: envelope.source.clone(),
        source_id: payload.id,
        notification_type: NotificationType::Maintenance,
        category: payload.category,
        incident_id: None,
        crns: payload.crns.into_vec(),
        short_description: payload.title,
        long_description: payload.description,
        event_time_start: payload.planned_start,
        event_time_end: payload.planned_end,
        source_creation_time: payload.created,
        source_update_time: payload.updated,
        tags: payload.tags,
        resource_display_names: vec![],
        pnp_removed: false,
    })
}

/// ServiceNow incident, which is also the BSPN shape: a BSPN names the
/// incident it narrates in `u_incident_id`, a plain incident is its own
/// incident.
fn snow_incident(envelope: &RawEnvelope) -> anyhow::Result<IngestMessage> {
    #[derive(Deserialize)]
    struct Payload {
        #[serde(alias = "source_id")]
        number: String,
        #[serde(default)]
        short_description: String,
        #[serde(default)]
        description: String,
        #[serde(default, alias = "crns")]
        crn: CrnField,
        #[serde(default)]
        u_incident_id: Option<String>,
        #[serde(default, alias = "source_creation_time")]
        sys_created_on: Option<String>,
        #[serde(alias = "source_update_time")]
        sys_updated_on: String,
        #[serde(default, alias = "tags")]
        u_tags: Vec<String>,
    }

    let payload: Payload =
        serde_json::from_slice(&envelope.body).context("parsing servicenow incident payload")?;

    let incident_id = payload
        .u_incident_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| payload.number.clone());

    Ok(IngestMessage {
        kind: ChangeKind::Update,
        source: envelope.source.clone(),
        source_id: payload.number,
        notification_type: NotificationType::Incident,
        category: "services".to_string(),
        incident_id: Some(incident_id),
        crns: payload.crn.into_vec(),
        short_description: payload.short_description,
        long_description: payload.description,
        event_time_start: None,
        event_time_end: None,
        source_creation_time: payload.sys_created_on.as_deref().and_then(snow_time),
        source_update_time: snow_time(&payload.sys_updated_on).unwrap_or_default(),
        tags: payload.u_tags,
        resource_display_names: vec![],
        pnp_removed: false,
    })
}

fn snow_case(envelope: &RawEnvelope) -> anyhow::Result<IngestMessage> {
    let mut message = snow_incident(envelope).context("parsing servicenow case payload")?;
    message.category = "case".to_string();
    Ok(message)
}

fn snow_change(envelope: &RawEnvelope) -> anyhow::Result<IngestMessage> {
    #[derive(Deserialize)]
    struct Payload {
        #[serde(alias = "source_id")]
        number: String,
        #[serde(default)]
        short_description: String,
        #[serde(default)]
        description: String,
        #[serde(default, alias = "crns")]
        crn: CrnField,
        #[serde(default)]
        start_date: Option<String>,
        #[serde(default)]
        end_date: Option<String>,
        #[serde(default, alias = "source_creation_time")]
        sys_created_on: Option<String>,
        #[serde(alias = "source_update_time")]
        sys_updated_on: String,
    }

    let payload: Payload =
        serde_json::from_slice(&envelope.body).context("parsing servicenow change payload")?;

    Ok(IngestMessage {
        kind: ChangeKind::Update,
        source: envelope.source.clone(),
        source_id: payload.number,
        notification_type: NotificationType::Maintenance,
        category: "services".to_string(),
        incident_id: None,
        crns: payload.crn.into_vec(),
        short_description: payload.short_description,
        long_description: payload.description,
        event_time_start: payload.start_date.as_deref().and_then(snow_time),
        event_time_end: payload.end_date.as_deref().and_then(snow_time),
        source_creation_time: payload.sys_created_on.as_deref().and_then(snow_time),
        source_update_time: snow_time(&payload.sys_updated_on).unwrap_or_default(),
        tags: vec![],
        resource_display_names: vec![],
        pnp_removed: false,
    })
}

fn ghe_announcement(envelope: &RawEnvelope) -> anyhow::Result<IngestMessage> {
    #[derive(Deserialize)]
    struct Payload {
        id: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        body: String,
        #[serde(default)]
        crns: CrnField,
        #[serde(default)]
        published_at: Option<String>,
        updated_at: String,
        #[serde(default)]
        labels: Vec<String>,
    }

    let payload: Payload =
        serde_json::from_slice(&envelope.body).context("parsing announcement payload")?;

    Ok(IngestMessage {
        kind: ChangeKind::Update,
        source: envelope.source.clone(),
        source_id: payload.id,
        notification_type: NotificationType::Announcement,
        category: "announcement".to_string(),
        incident_id: None,
        crns: payload.crns.into_vec(),
        short_description: payload.title,
        long_description: payload.body,
        event_time_start: None,
        event_time_end: None,
        source_creation_time: payload.published_at,
        source_update_time: payload.updated_at,
        tags: payload.labels,
        resource_display_names: vec![],
        pnp_removed: false,
    })
}
