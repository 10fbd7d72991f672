use chrono::{DateTime, Utc};
use models::Subscription;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub record_id: String,
    pub name: String,
    pub url: String,
    pub target_address: String,
    pub target_token: String,
    pub expiration: Option<DateTime<Utc>>,
    /// Consecutive permanent delivery failures; reset on success.
    pub failures: i32,
    pub disabled: bool,
}

impl SubscriptionRow {
    pub fn into_subscription(self) -> Subscription {
        Subscription {
            record_id: self.record_id,
            name: self.name,
            target_address: self.target_address,
            target_token: self.target_token,
            expiration: self.expiration,
        }
    }
}

const COLUMNS: &str =
    "record_id, name, url, target_address, target_token, expiration, failures, disabled";

/// Resolve a watch's weak subscription reference at delivery time.
pub async fn fetch_by_url(
    pool: &sqlx::PgPool,
    url: &str,
) -> sqlx::Result<Option<SubscriptionRow>> {
    sqlx::query_as::<_, SubscriptionRow>(&format!(
        "select {COLUMNS} from subscriptions where url = $1"
    ))
    .bind(url)
    .fetch_optional(pool)
    .await
}

/// Count a permanent delivery failure and return the running total, so the
/// caller can disable the subscription past its threshold.
pub async fn record_failure(pool: &sqlx::PgPool, record_id: &str) -> sqlx::Result<i32> {
    let (failures,): (i32,) = sqlx::query_as(
        "update subscriptions set failures = failures + 1
         where record_id = $1
         returning failures",
    )
    .bind(record_id)
    .fetch_one(pool)
    .await?;

    Ok(failures)
}

pub async fn reset_failures(pool: &sqlx::PgPool, record_id: &str) -> sqlx::Result<()> {
    sqlx::query("update subscriptions set failures = 0 where record_id = $1")
        .bind(record_id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn disable(pool: &sqlx::PgPool, record_id: &str) -> sqlx::Result<()> {
    sqlx::query("update subscriptions set disabled = true where record_id = $1")
        .bind(record_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Janitor: remove expired subscriptions together with the watches they
/// own. Returns (subscriptions, watches) removed.
pub async fn delete_expired(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    now: DateTime<Utc>,
) -> sqlx::Result<(u64, u64)> {
    let watches = sqlx::query(
        "delete from watches where subscription_url in
            (select url from subscriptions where expiration is not null and expiration <= $1)",
    )
    .bind(now)
    .execute(&mut *txn)
    .await?
    .rows_affected();

    let subscriptions = sqlx::query(
        "delete from subscriptions where expiration is not null and expiration <= $1",
    )
    .bind(now)
    .execute(&mut *txn)
    .await?
    .rows_affected();

    Ok((subscriptions, watches))
}
