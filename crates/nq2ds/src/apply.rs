//! The ordered, idempotent write path. `decide` is pure and carries the
//! whole ordering contract; `apply_message` wraps it in one transaction per
//! upstream record so fan-out sees all of a record's rows or none.

use chrono::{DateTime, Utc};
use models::{ChangeKind, IngestMessage, Notification};
use pnp_sql::NotificationRow;

/// Verdict for one (source, source-id, CRN) row.
#[derive(Debug, Clone)]
pub enum Decision {
    /// First persistence of this row.
    Insert(NotificationRow),
    /// Incoming is strictly newer: written unconditionally.
    Write(NotificationRow),
    /// Same source-update instant but differing content: stored anyway.
    Refresh(NotificationRow),
    /// Same instant, same content. Applying again must change nothing.
    Unchanged,
    /// Incoming regresses the source-update timestamp; dropped.
    Outdated,
}

impl Decision {
    pub fn outcome(&self) -> &'static str {
        match self {
            Decision::Insert(_) => "inserted",
            Decision::Write(_) => "written",
            Decision::Refresh(_) => "refreshed",
            Decision::Unchanged => "unchanged",
            Decision::Outdated => "outdated",
        }
    }

    pub fn mutates(&self) -> bool {
        matches!(
            self,
            Decision::Insert(_) | Decision::Write(_) | Decision::Refresh(_)
        )
    }
}

/// Order one incoming row against its stored counterpart.
///
/// * No stored row: insert. Bulk-loads seed the pipeline-observed creation
///   timestamp from the source creation timestamp.
/// * Strictly older incoming source-update: `Outdated`, never written.
/// * Equal: a refresh; content is stored only when its hash differs.
/// * Strictly newer: written unconditionally, pipeline-observed update
///   becomes `now`.
pub fn decide(
    kind: ChangeKind,
    existing: Option<&NotificationRow>,
    incoming: &Notification,
    now: DateTime<Utc>,
) -> Decision {
    let Some(existing) = existing else {
        let mut fresh = incoming.clone();
        if kind == ChangeKind::BulkLoad {
            fresh.pnp_creation_time = fresh.source_creation_time.unwrap_or(now);
        }
        return Decision::Insert(NotificationRow::from_notification(&fresh));
    };

    use std::cmp::Ordering;
    match incoming
        .source_update_time
        .cmp(&existing.source_update_time)
    {
        Ordering::Less => Decision::Outdated,
        Ordering::Equal => {
            if incoming.content_hash() == existing.record_hash {
                Decision::Unchanged
            } else {
                let mut refreshed = incoming.clone();
                refreshed.pnp_update_time = now;
                Decision::Refresh(NotificationRow::from_notification(&refreshed))
            }
        }
        Ordering::Greater => {
            let mut written = incoming.clone();
            written.pnp_update_time = now;
            Decision::Write(NotificationRow::from_notification(&written))
        }
    }
}

#[derive(Debug)]
pub struct ApplyReport {
    /// Representative notification for downstream emission, present when
    /// any row mutated.
    pub changed: Option<Notification>,
    pub outcomes: Vec<&'static str>,
    pub outdated: usize,
}

/// Apply one typed message: every CRN row of the record inside a single
/// transaction.
pub async fn apply_message(
    pool: &sqlx::PgPool,
    message: &IngestMessage,
    now: DateTime<Utc>,
) -> anyhow::Result<ApplyReport> {
    use anyhow::Context;

    let rows = message
        .to_notifications(now)
        .context("expanding message rows")?;

    let mut txn = pool.begin().await.context("beginning transaction")?;
    let mut report = ApplyReport {
        changed: None,
        outcomes: Vec::with_capacity(rows.len()),
        outdated: 0,
    };

    for incoming in rows {
        let existing = pnp_sql::notifications::fetch_record_for_update(
            &mut txn,
            &incoming.source,
            &incoming.source_id,
            &incoming.crn_full,
        )
        .await
        .context("claiming stored row")?;

        let decision = decide(message.kind, existing.as_ref(), &incoming, now);
        report.outcomes.push(decision.outcome());

        match decision {
            Decision::Insert(row) => {
                pnp_sql::notifications::insert(&mut txn, &row).await.context("inserting row")?;
                report.changed.get_or_insert(incoming);
            }
            Decision::Write(row) | Decision::Refresh(row) => {
                pnp_sql::notifications::update_content(&mut txn, &row)
                    .await
                    .context("updating row")?;
                report.changed.get_or_insert(incoming);
            }
            Decision::Unchanged => {}
            Decision::Outdated => report.outdated += 1,
        }
    }

    txn.commit().await.context("committing transaction")?;
    Ok(report)
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{NotificationType, RecordId, TranslatedText};

    const CRN: &str = "crn:v1:bluemix:public:svc:us-south::::";

    fn at(raw: &str) -> DateTime<Utc> {
        raw.parse().unwrap()
    }

    fn incoming(source_update: &str) -> Notification {
        Notification {
            record_id: RecordId::derive("servicenow", "INC001", CRN),
            source: "servicenow".to_string(),
            source_id: "INC001".to_string(),
            crn_full: CRN.to_string(),
            notification_type: NotificationType::Incident,
            category: "services".to_string(),
            incident_id: Some("INC001".to_string()),
            short_description: "down".to_string(),
            long_description: "the service is down".to_string(),
            event_time_start: None,
            event_time_end: None,
            source_creation_time: Some(at("2025-01-01T08:00:00Z")),
            source_update_time: at(source_update),
            pnp_creation_time: at("2025-01-01T10:05:00Z"),
            pnp_update_time: at("2025-01-01T10:05:00Z"),
            tags: vec![],
            resource_display_names: vec![TranslatedText::en("Service")],
            pnp_removed: false,
        }
    }

    fn stored(source_update: &str) -> NotificationRow {
        NotificationRow::from_notification(&incoming(source_update))
    }

    #[test]
    fn test_missing_row_is_inserted() {
        let decision = decide(
            ChangeKind::Update,
            None,
            &incoming("2025-01-01T10:00:00Z"),
            at("2025-01-01T10:05:00Z"),
        );
        assert!(matches!(decision, Decision::Insert(_)));
    }

    #[test]
    fn test_bulk_load_seeds_creation_from_source() {
        let decision = decide(
            ChangeKind::BulkLoad,
            None,
            &incoming("2025-01-01T10:00:00Z"),
            at("2025-01-01T10:05:00Z"),
        );
        let Decision::Insert(row) = decision else {
            panic!("expected insert");
        };
        assert_eq!(row.pnp_creation_time, at("2025-01-01T08:00:00Z"));
    }

    #[test]
    fn test_regressed_update_is_outdated() {
        let decision = decide(
            ChangeKind::Update,
            Some(&stored("2025-01-01T10:00:00Z")),
            &incoming("2024-12-31T23:00:00Z"),
            at("2025-01-01T10:05:00Z"),
        );
        assert!(matches!(decision, Decision::Outdated), "{decision:?}");
    }

    #[test]
    fn test_equal_time_same_content_is_unchanged() {
        let decision = decide(
            ChangeKind::Update,
            Some(&stored("2025-01-01T10:00:00Z")),
            &incoming("2025-01-01T10:00:00Z"),
            at("2025-01-01T10:05:00Z"),
        );
        assert!(matches!(decision, Decision::Unchanged), "{decision:?}");
    }

    #[test]
    fn test_equal_time_new_content_is_a_refresh() {
        let mut revised = incoming("2025-01-01T10:00:00Z");
        revised.short_description = "partially restored".to_string();

        let now = at("2025-01-01T10:30:00Z");
        let decision = decide(
            ChangeKind::Update,
            Some(&stored("2025-01-01T10:00:00Z")),
            &revised,
            now,
        );
        let Decision::Refresh(row) = decision else {
            panic!("expected refresh");
        };
        assert_eq!(row.short_description, "partially restored");
        assert_eq!(row.pnp_update_time, now);
    }

    #[test]
    fn test_newer_update_is_written_unconditionally() {
        // Identical content; only the source-update instant advanced.
        let now = at("2025-01-01T11:00:00Z");
        let decision = decide(
            ChangeKind::Update,
            Some(&stored("2025-01-01T10:00:00Z")),
            &incoming("2025-01-01T10:30:00Z"),
            now,
        );
        let Decision::Write(row) = decision else {
            panic!("expected write");
        };
        assert_eq!(row.pnp_update_time, now);
    }

    #[test]
    fn test_bulk_load_never_regresses_newer_rows() {
        let decision = decide(
            ChangeKind::BulkLoad,
            Some(&stored("2025-01-01T10:00:00Z")),
            &incoming("2025-01-01T09:00:00Z"),
            at("2025-01-01T10:05:00Z"),
        );
        assert!(matches!(decision, Decision::Outdated), "{decision:?}");
    }

    #[test]
    fn test_tombstone_rides_the_ordering_rules() {
        let mut removal = incoming("2025-01-01T10:30:00Z");
        removal.pnp_removed = true;

        let decision = decide(
            ChangeKind::Update,
            Some(&stored("2025-01-01T10:00:00Z")),
            &removal,
            at("2025-01-01T11:00:00Z"),
        );
        let Decision::Write(row) = decision else {
            panic!("expected write");
        };
        assert!(row.pnp_removed);
    }

    #[test]
    fn test_decide_is_idempotent() {
        // Applying a write, then deciding again with the written row stored,
        // must be a no-op.
        let now = at("2025-01-01T11:00:00Z");
        let first = decide(
            ChangeKind::Update,
            Some(&stored("2025-01-01T10:00:00Z")),
            &incoming("2025-01-01T10:30:00Z"),
            now,
        );
        let Decision::Write(written) = first else {
            panic!("expected write");
        };
        let second = decide(
            ChangeKind::Update,
            Some(&written),
            &incoming("2025-01-01T10:30:00Z"),
            at("2025-01-01T11:05:00Z"),
        );
        assert!(matches!(second, Decision::Unchanged), "{second:?}");
    }
}
