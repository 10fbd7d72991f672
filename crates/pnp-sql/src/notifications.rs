use chrono::{DateTime, Utc};
use models::{Notification, NotificationType, RecordId, TranslatedText};
use sqlx::types::Json;

/// One persisted notification row: a single (source, source-id, CRN).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NotificationRow {
    pub record_id: String,
    pub source: String,
    pub source_id: String,
    pub crn_full: String,
    pub notification_type: String,
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
    /// Comma-joined, order preserved.
    pub tags: String,
    pub resource_display_names: Json<Vec<TranslatedText>>,
    /// Hash over content fields, used for same-timestamp refresh decisions.
    pub record_hash: String,
    pub pnp_removed: bool,
}

impl NotificationRow {
    pub fn into_notification(self) -> anyhow::Result<Notification> {
        let notification_type = self
            .notification_type
            .parse::<NotificationType>()
            .map_err(|err| anyhow::anyhow!("row {}: {err}", self.record_id))?;

        Ok(Notification {
            record_id: RecordId::from(self.record_id),
            source: self.source,
            source_id: self.source_id,
            crn_full: self.crn_full,
            notification_type,
            category: self.category,
            incident_id: self.incident_id,
            short_description: self.short_description,
            long_description: self.long_description,
            event_time_start: self.event_time_start,
            event_time_end: self.event_time_end,
            source_creation_time: self.source_creation_time,
            source_update_time: self.source_update_time,
            pnp_creation_time: self.pnp_creation_time,
            pnp_update_time: self.pnp_update_time,
            tags: split_tags(&self.tags),
            resource_display_names: self.resource_display_names.0,
            pnp_removed: self.pnp_removed,
        })
    }

    pub fn from_notification(notification: &Notification) -> NotificationRow {
        NotificationRow {
            record_id: notification.record_id.to_string(),
            source: notification.source.clone(),
            source_id: notification.source_id.clone(),
            crn_full: notification.crn_full.clone(),
            notification_type: notification.notification_type.to_string(),
            category: notification.category.clone(),
            incident_id: notification.incident_id.clone(),
            short_description: notification.short_description.clone(),
            long_description: notification.long_description.clone(),
            event_time_start: notification.event_time_start,
            event_time_end: notification.event_time_end,
            source_creation_time: notification.source_creation_time,
            source_update_time: notification.source_update_time,
            pnp_creation_time: notification.pnp_creation_time,
            pnp_update_time: notification.pnp_update_time,
            tags: notification.tags.join(","),
            resource_display_names: Json(notification.resource_display_names.clone()),
            record_hash: notification.content_hash(),
            pnp_removed: notification.pnp_removed,
        }
    }
}

pub fn split_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

const COLUMNS: &str = "record_id, source, source_id, crn_full, notification_type, category, \
     incident_id, short_description, long_description, event_time_start, event_time_end, \
     source_creation_time, source_update_time, pnp_creation_time, pnp_update_time, tags, \
     resource_display_names, record_hash, pnp_removed";

/// All rows of one upstream record, ordered by record id so collation picks
/// a deterministic representative.
pub async fn fetch_for_source_id(
    pool: &sqlx::PgPool,
    source: &str,
    source_id: &str,
) -> sqlx::Result<Vec<NotificationRow>> {
    sqlx::query_as::<_, NotificationRow>(&format!(
        "select {COLUMNS} from notifications
         where source = $1 and source_id = $2
         order by record_id asc"
    ))
    .bind(source)
    .bind(source_id)
    .fetch_all(pool)
    .await
}

/// All rows narrating one incident, across source-ids. BSPNs replace their
/// predecessors, so recency selection needs the whole group.
pub async fn fetch_for_incident(
    pool: &sqlx::PgPool,
    source: &str,
    incident_id: &str,
) -> sqlx::Result<Vec<NotificationRow>> {
    sqlx::query_as::<_, NotificationRow>(&format!(
        "select {COLUMNS} from notifications
         where source = $1 and incident_id = $2
         order by record_id asc"
    ))
    .bind(source)
    .bind(incident_id)
    .fetch_all(pool)
    .await
}

/// Every live row for a source, used by the reconcilers to diff a fresh
/// upstream snapshot against persisted state.
pub async fn fetch_all_for_source(
    pool: &sqlx::PgPool,
    source: &str,
) -> sqlx::Result<Vec<NotificationRow>> {
    sqlx::query_as::<_, NotificationRow>(&format!(
        "select {COLUMNS} from notifications where source = $1"
    ))
    .bind(source)
    .fetch_all(pool)
    .await
}

/// Claim one row for ordered mutation. Row-level lock serializes concurrent
/// writers of the same (source, source-id, CRN).
pub async fn fetch_record_for_update(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    source: &str,
    source_id: &str,
    crn_full: &str,
) -> sqlx::Result<Option<NotificationRow>> {
    sqlx::query_as::<_, NotificationRow>(&format!(
        "select {COLUMNS} from notifications
         where source = $1 and source_id = $2 and crn_full = $3
         for update"
    ))
    .bind(source)
    .bind(source_id)
    .bind(crn_full)
    .fetch_optional(txn)
    .await
}

pub async fn insert(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    row: &NotificationRow,
) -> sqlx::Result<()> {
    sqlx::query(
        "insert into notifications (record_id, source, source_id, crn_full, notification_type,
            category, incident_id, short_description, long_description, event_time_start,
            event_time_end, source_creation_time, source_update_time, pnp_creation_time,
            pnp_update_time, tags, resource_display_names, record_hash, pnp_removed)
         values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)",
    )
    .bind(&row.record_id)
    .bind(&row.source)
    .bind(&row.source_id)
    .bind(&row.crn_full)
    .bind(&row.notification_type)
    .bind(&row.category)
    .bind(&row.incident_id)
    .bind(&row.short_description)
    .bind(&row.long_description)
    .bind(row.event_time_start)
    .bind(row.event_time_end)
    .bind(row.source_creation_time)
    .bind(row.source_update_time)
    .bind(row.pnp_creation_time)
    .bind(row.pnp_update_time)
    .bind(&row.tags)
    .bind(&row.resource_display_names)
    .bind(&row.record_hash)
    .bind(row.pnp_removed)
    .execute(txn)
    .await?;

    Ok(())
}

/// Overwrite the content fields of an existing row. The caller decides,
/// under the ordering rules, whether this write is permitted; creation
/// timestamps are never touched here.
pub async fn update_content(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    row: &NotificationRow,
) -> sqlx::Result<()> {
    sqlx::query(
        "update notifications set
            notification_type = $4, category = $5, incident_id = $6,
            short_description = $7, long_description = $8,
            event_time_start = $9, event_time_end = $10,
            source_creation_time = $11, source_update_time = $12,
            pnp_update_time = $13, tags = $14, resource_display_names = $15,
            record_hash = $16, pnp_removed = $17
         where source = $1 and source_id = $2 and crn_full = $3",
    )
    .bind(&row.source)
    .bind(&row.source_id)
    .bind(&row.crn_full)
    .bind(&row.notification_type)
    .bind(&row.category)
    .bind(&row.incident_id)
    .bind(&row.short_description)
    .bind(&row.long_description)
    .bind(row.event_time_start)
    .bind(row.event_time_end)
    .bind(row.source_creation_time)
    .bind(row.source_update_time)
    .bind(row.pnp_update_time)
    .bind(&row.tags)
    .bind(&row.resource_display_names)
    .bind(&row.record_hash)
    .bind(row.pnp_removed)
    .execute(txn)
    .await?;

    Ok(())
}

/// Tombstone one row. The row remains for late subscribers and the
/// retention sweep.
pub async fn set_removed(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    source: &str,
    source_id: &str,
    crn_full: &str,
    now: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        "update notifications set pnp_removed = true, pnp_update_time = $4
         where source = $1 and source_id = $2 and crn_full = $3",
    )
    .bind(source)
    .bind(source_id)
    .bind(crn_full)
    .bind(now)
    .execute(txn)
    .await?;

    Ok(())
}

/// Physically remove tombstoned rows past the retention window. The only
/// place in the pipeline that deletes notification rows.
pub async fn delete_removed_before(
    pool: &sqlx::PgPool,
    cutoff: DateTime<Utc>,
) -> sqlx::Result<u64> {
    let result = sqlx::query(
        "delete from notifications where pnp_removed = true and pnp_update_time < $1",
    )
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_tags() {
        assert_eq!(split_tags(""), Vec::<String>::new());
        assert_eq!(split_tags("retract,retract-1"), vec!["retract", "retract-1"]);
        assert_eq!(split_tags(" a , b ,,c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_row_round_trip() {
        let at: DateTime<Utc> = "2025-01-01T10:00:00Z".parse().unwrap();
        let notification = Notification {
            record_id: RecordId::derive("doctor", "M42", "crn:v1:bluemix:public:svc:us-south::::"),
            source: "doctor".to_string(),
            source_id: "M42".to_string(),
            crn_full: "crn:v1:bluemix:public:svc:us-south::::".to_string(),
            notification_type: NotificationType::Maintenance,
            category: "runtimes".to_string(),
            incident_id: None,
            short_description: "window".to_string(),
            long_description: "maintenance window".to_string(),
            event_time_start: Some(at),
            event_time_end: None,
            source_creation_time: Some(at),
            source_update_time: at,
            pnp_creation_time: at,
            pnp_update_time: at,
            tags: vec!["t1".to_string(), "t2".to_string()],
            resource_display_names: vec![TranslatedText::en("Service")],
            pnp_removed: false,
        };

        let row = NotificationRow::from_notification(&notification);
        assert_eq!(row.tags, "t1,t2");
        assert_eq!(row.record_hash, notification.content_hash());
        assert_eq!(row.into_notification().unwrap(), notification);
    }

    #[test]
    fn test_row_with_unknown_type_is_rejected() {
        let mut row = NotificationRow::from_notification(&{
            let at: DateTime<Utc> = "2025-01-01T10:00:00Z".parse().unwrap();
            Notification {
                record_id: RecordId::derive("doctor", "M42", "crn"),
                source: "doctor".to_string(),
                source_id: "M42".to_string(),
                crn_full: "crn".to_string(),
                notification_type: NotificationType::Maintenance,
                category: String::new(),
                incident_id: None,
                short_description: String::new(),
                long_description: String::new(),
                event_time_start: None,
                event_time_end: None,
                source_creation_time: None,
                source_update_time: at,
                pnp_creation_time: at,
                pnp_update_time: at,
                tags: vec![],
                resource_display_names: vec![],
                pnp_removed: false,
            }
        });
        row.notification_type = "problem".to_string();
        assert!(row.into_notification().is_err());
    }
}
