use models::{Watch, WatchKind};
use sqlx::types::Json;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WatchRow {
    pub record_id: String,
    pub subscription_url: String,
    pub kind: String,
    pub path: String,
    pub crn_masks: Json<Vec<String>>,
    pub record_ids: Option<Json<Vec<String>>>,
}

impl WatchRow {
    pub fn into_watch(self) -> anyhow::Result<Watch> {
        let kind = self
            .kind
            .parse::<WatchKind>()
            .map_err(|err| anyhow::anyhow!("watch {}: {err}", self.record_id))?;

        Ok(Watch {
            record_id: self.record_id,
            subscription_url: self.subscription_url,
            kind,
            path: self.path,
            crn_masks: self.crn_masks.0,
            record_ids: self.record_ids.map(|ids| ids.0),
        })
    }
}

/// Watches of one kind whose subscription is neither expired nor disabled.
/// The per-watch CRN matching happens in the fan-out, not here.
pub async fn fetch_active_by_kind(
    pool: &sqlx::PgPool,
    kind: WatchKind,
) -> sqlx::Result<Vec<WatchRow>> {
    sqlx::query_as::<_, WatchRow>(
        "select w.record_id, w.subscription_url, w.kind, w.path, w.crn_masks, w.record_ids
         from watches w
         join subscriptions s on s.url = w.subscription_url
         where w.kind = $1
           and not s.disabled
           and (s.expiration is null or s.expiration > now())",
    )
    .bind(kind.to_string())
    .fetch_all(pool)
    .await
}
