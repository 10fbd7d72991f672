//! Subscription fan-out: turns each committed notification event into
//! webhook deliveries. Rows are re-read, collated, filtered against each
//! watch, and posted to the owning subscription's target.

pub mod collate;
pub mod deliver;
pub mod janitor;
pub mod tags;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use models::{Crn, FanoutMessage, NotificationType, WatchKind};
use prometheus::IntCounter;

lazy_static! {
    static ref EVENTS: IntCounter = prometheus::register_int_counter!(
        "pnp_fanout_events_total",
        "Fan-out events processed."
    )
    .unwrap();
    static ref DUPLICATES: IntCounter = prometheus::register_int_counter!(
        "pnp_fanout_duplicate_events_total",
        "Fan-out events rejected by the duplicate-emission guard."
    )
    .unwrap();
    static ref SUPPRESSED: IntCounter = prometheus::register_int_counter!(
        "pnp_fanout_retract_suppressed_total",
        "Notifications withheld from a watch because of a leading retract tag."
    )
    .unwrap();
}

/// How long a processed event key is remembered by the duplicate guard.
const SEEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Duplicate-emission guard: processed event keys with their expiry.
/// At-least-once delivery across process restarts is still permitted.
#[derive(Default)]
struct SeenCache {
    entries: Mutex<HashMap<String, Instant>>,
}

impl SeenCache {
    /// Record `key`; true when it was already present and unexpired.
    fn check_and_insert(&self, key: String) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        entries.retain(|_, expires| *expires > now);
        entries.insert(key, now + SEEN_TTL).is_some()
    }
}

pub struct Fanout {
    pool: sqlx::PgPool,
    deliverer: deliver::Deliverer,
    seen: SeenCache,
}

impl Fanout {
    pub fn new(pool: sqlx::PgPool, deliverer: deliver::Deliverer) -> Fanout {
        Fanout {
            pool,
            deliverer,
            seen: SeenCache::default(),
        }
    }

    /// Handle one fan-out event from the bus.
    pub async fn handle(&self, plaintext: Vec<u8>) -> bus::Outcome {
        let event: FanoutMessage = match serde_json::from_slice(&plaintext) {
            Ok(event) => event,
            Err(error) => {
                tracing::error!(%error, "dropping undecodable fan-out event");
                return bus::Outcome::Ack;
            }
        };
        EVENTS.inc();

        let key = format!(
            "{}|{}|{}",
            event.source, event.source_id, event.pnp_update_time
        );
        if self.seen.check_and_insert(key) {
            DUPLICATES.inc();
            tracing::debug!(
                source = %event.source, source_id = %event.source_id,
                "duplicate emission rejected"
            );
            return bus::Outcome::Ack;
        }

        match self.process(&event).await {
            Ok(()) => bus::Outcome::Ack,
            Err(error) => {
                tracing::warn!(
                    source = %event.source, source_id = %event.source_id,
                    error = format!("{error:#}"),
                    "fan-out processing failed; leaving event for redelivery"
                );
                bus::Outcome::Nack
            }
        }
    }

    async fn process(&self, event: &FanoutMessage) -> anyhow::Result<()> {
        use anyhow::Context;

        // Re-read the authoritative rows rather than trusting the event
        // payload. Incident events pull the whole incident group so BSPN
        // recency selection sees every narration.
        let rows = if event.notification_type == NotificationType::Incident
            && !event.incident_id.is_empty()
        {
            pnp_sql::notifications::fetch_for_incident(&self.pool, &event.source, &event.incident_id)
                .await
        } else {
            pnp_sql::notifications::fetch_for_source_id(&self.pool, &event.source, &event.source_id)
                .await
        }
        .context("re-reading notification rows")?;

        let mut notifications = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_notification() {
                Ok(notification) => notifications.push(notification),
                Err(error) => tracing::warn!(%error, "skipping unreadable row"),
            }
        }

        for outbound in collate::collate(notifications) {
            self.dispatch(&outbound).await.context("dispatching")?;
        }
        Ok(())
    }

    async fn dispatch(&self, outbound: &collate::Outbound) -> anyhow::Result<()> {
        use anyhow::Context;

        let representative = &outbound.representative;
        let kind = watch_kind_for(representative.notification_type);
        let watches = pnp_sql::watches::fetch_active_by_kind(&self.pool, kind)
            .await
            .context("loading watches")?;

        let crns: Vec<Crn> = outbound
            .crns
            .iter()
            .filter_map(|crn| crn.parse().ok())
            .collect();

        let mut notified: HashSet<String> = HashSet::new();
        let mut deliveries = Vec::new();

        for watch_row in watches {
            let watch = match watch_row.into_watch() {
                Ok(watch) => watch,
                Err(error) => {
                    tracing::warn!(%error, "skipping unreadable watch");
                    continue;
                }
            };
            if let Some(record_ids) = &watch.record_ids {
                if !record_ids.contains(&representative.record_id.to_string()) {
                    continue;
                }
            }
            if !watch.matches_any_crn(&crns) {
                continue;
            }

            let requested = tags::requested_tags(&watch.path);
            if representative.is_retracted()
                && !requested.iter().any(|tag| tag.starts_with("retract"))
            {
                SUPPRESSED.inc();
                continue;
            }
            let Some(delivered_tags) = tags::filter_tags(&representative.tags, &requested) else {
                continue;
            };

            let subscription =
                match pnp_sql::subscriptions::fetch_by_url(&self.pool, &watch.subscription_url)
                    .await
                    .context("resolving subscription")?
                {
                    Some(subscription) => subscription,
                    None => {
                        tracing::debug!(
                            url = %watch.subscription_url,
                            "watch references a missing subscription"
                        );
                        continue;
                    }
                };
            if subscription.disabled
                || subscription
                    .clone()
                    .into_subscription()
                    .is_expired(chrono::Utc::now())
            {
                continue;
            }
            if !notified.insert(subscription.record_id.clone()) {
                continue;
            }

            let payload = collate::OutboundNotification::new(outbound, delivered_tags);
            deliveries.push(async move {
                self.deliverer.deliver(&subscription, &payload).await;
            });
        }

        futures::future::join_all(deliveries).await;
        Ok(())
    }
}

/// Watch kinds carry their own names for incident and maintenance events;
/// the generic `notification` kind covers the types without a dedicated
/// kind (announcement, security).
fn watch_kind_for(notification_type: NotificationType) -> WatchKind {
    match notification_type {
        NotificationType::Incident => WatchKind::Incident,
        NotificationType::Maintenance => WatchKind::Maintenance,
        NotificationType::Announcement | NotificationType::Security => WatchKind::Notification,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_seen_cache_rejects_repeats() {
        let seen = SeenCache::default();
        assert!(!seen.check_and_insert("a|b|t1".to_string()));
        assert!(seen.check_and_insert("a|b|t1".to_string()));
        assert!(!seen.check_and_insert("a|b|t2".to_string()));
    }

    #[test]
    fn test_watch_kind_mapping() {
        assert_eq!(watch_kind_for(NotificationType::Incident), WatchKind::Incident);
        assert_eq!(watch_kind_for(NotificationType::Maintenance), WatchKind::Maintenance);
        assert_eq!(watch_kind_for(NotificationType::Announcement), WatchKind::Notification);
        assert_eq!(watch_kind_for(NotificationType::Security), WatchKind::Notification);
    }
}
