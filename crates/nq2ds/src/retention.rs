//! Retention sweep: tombstoned rows past the window are physically
//! removed here and nowhere else.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::IntCounter;

lazy_static! {
    static ref DELETED: IntCounter = prometheus::register_int_counter!(
        "pnp_nq2ds_retention_deleted_total",
        "Tombstoned rows removed by the retention sweep."
    )
    .unwrap();
}

const SWEEP_PERIOD: Duration = Duration::from_secs(6 * 60 * 60);

/// Sweep until `shutdown` resolves. Failures are logged; the next sweep
/// re-attempts.
pub async fn sweep_loop(
    pool: sqlx::PgPool,
    retention_days: u32,
    shutdown: impl std::future::Future<Output = ()>,
) {
    let mut ticker = tokio::time::interval(SWEEP_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => return,
            _ = ticker.tick() => {
                let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(retention_days));
                match pnp_sql::notifications::delete_removed_before(&pool, cutoff).await {
                    Ok(deleted) if deleted > 0 => {
                        DELETED.inc_by(deleted);
                        tracing::info!(deleted, %cutoff, "retention sweep removed tombstoned rows");
                    }
                    Ok(_) => tracing::debug!(%cutoff, "retention sweep found nothing to remove"),
                    Err(error) => tracing::warn!(%error, "retention sweep failed; next sweep re-attempts"),
                }
            }
        }
    }
}
