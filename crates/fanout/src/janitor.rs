//! Janitor: expired subscriptions are removed together with the watches
//! they own, on a fixed cadence.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::IntCounterVec;

lazy_static! {
    static ref REMOVED: IntCounterVec = prometheus::register_int_counter_vec!(
        "pnp_fanout_janitor_removed_total",
        "Rows removed by the subscription janitor, by table.",
        &["table"]
    )
    .unwrap();
}

pub async fn sweep_loop(
    pool: sqlx::PgPool,
    period: Duration,
    shutdown: impl std::future::Future<Output = ()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => return,
            _ = ticker.tick() => {
                if let Err(error) = sweep(&pool).await {
                    tracing::warn!(%error, "janitor sweep failed; next sweep re-attempts");
                }
            }
        }
    }
}

async fn sweep(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    use anyhow::Context;

    let mut txn = pool.begin().await.context("beginning janitor transaction")?;
    let (subscriptions, watches) =
        pnp_sql::subscriptions::delete_expired(&mut txn, chrono::Utc::now())
            .await
            .context("deleting expired subscriptions")?;
    txn.commit().await.context("committing janitor transaction")?;

    if subscriptions > 0 || watches > 0 {
        REMOVED.with_label_values(&["subscriptions"]).inc_by(subscriptions);
        REMOVED.with_label_values(&["watches"]).inc_by(watches);
        tracing::info!(subscriptions, watches, "removed expired subscriptions");
    }
    Ok(())
}
