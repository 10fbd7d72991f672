//! Ticker loops driving the reconcilers. Ticks are serialized within one
//! adapter; adapters run in parallel with each other. The first tick fires
//! immediately after process start so it is observable without waiting a
//! full cadence.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::Shared;

use crate::{reconcile, Adapter, PUBLISHED};

pub struct Scheduler {
    pool: sqlx::PgPool,
    publisher: Arc<bus::Publisher>,
    /// Routing key the NQ2DS consumer is bound to.
    nq_qkey: String,
    period: Duration,
}

impl Scheduler {
    pub fn new(
        pool: sqlx::PgPool,
        publisher: Arc<bus::Publisher>,
        nq_qkey: String,
        period: Duration,
    ) -> Scheduler {
        Scheduler {
            pool,
            publisher,
            nq_qkey,
            period,
        }
    }

    /// Run every adapter until `shutdown` resolves.
    pub async fn run<S>(self, adapters: Vec<Arc<dyn Adapter>>, shutdown: Shared<S>)
    where
        S: std::future::Future<Output = ()> + Send + 'static,
    {
        let this = Arc::new(self);
        let mut loops = Vec::new();
        for adapter in adapters {
            loops.push(tokio::spawn(
                this.clone().run_one(adapter, shutdown.clone()),
            ));
        }
        for one in loops {
            let _ = one.await;
        }
    }

    async fn run_one<S>(self: Arc<Self>, adapter: Arc<dyn Adapter>, shutdown: Shared<S>)
    where
        S: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!(source = adapter.source(), "reconciler shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(error) = self.tick(adapter.as_ref()).await {
                        tracing::warn!(source = adapter.source(), %error, "reconcile tick failed; next tick re-attempts");
                    }
                }
            }
        }
    }

    /// One reconcile pass: fetch, load, diff, publish. A failed fetch
    /// aborts without publishing.
    #[tracing::instrument(skip_all, fields(source = adapter.source()))]
    pub async fn tick(&self, adapter: &dyn Adapter) -> anyhow::Result<()> {
        use anyhow::Context;

        let snapshot = adapter.fetch().await.context("upstream fetch")?;
        let stored = pnp_sql::notifications::fetch_all_for_source(&self.pool, adapter.source())
            .await
            .context("loading persisted rows")?;

        let changes = reconcile::diff(&snapshot, &stored, Utc::now());
        tracing::info!(
            snapshot = snapshot.len(),
            stored = stored.len(),
            changes = changes.len(),
            "reconciled"
        );

        for message in changes {
            let payload = serde_json::to_vec(&message).context("encoding typed message")?;
            match self.publisher.publish(&self.nq_qkey, &payload).await {
                Ok(()) => {
                    let kind = match message.kind {
                        models::ChangeKind::BulkLoad => "bulkload",
                        models::ChangeKind::Update => "update",
                    };
                    PUBLISHED.with_label_values(&[&message.source, kind]).inc();
                }
                Err(error) => {
                    // Skipped now, caught by the diff on the next tick.
                    tracing::warn!(
                        source_id = %message.source_id, %error,
                        "failed to publish change; deferring to next tick"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Serve one raw hook topic: open each envelope, normalize it, and forward
/// the typed message. Malformed payloads are counted and dropped; transient
/// publish failures are redelivered by the bus.
pub async fn serve_raw_topic<S>(
    consumer: bus::Consumer,
    publisher: Arc<bus::Publisher>,
    topic: &'static str,
    nq_qkey: String,
    shutdown: S,
) -> Result<(), bus::Error>
where
    S: std::future::Future<Output = ()>,
{
    consumer
        .serve(
            move |plaintext: Vec<u8>| {
                let publisher = publisher.clone();
                let nq_qkey = nq_qkey.clone();
                async move {
                    let envelope: models::RawEnvelope = match serde_json::from_slice(&plaintext) {
                        Ok(envelope) => envelope,
                        Err(error) => {
                            tracing::error!(%topic, %error, "dropping undecodable raw envelope");
                            crate::MALFORMED.with_label_values(&["unknown"]).inc();
                            return bus::Outcome::Ack;
                        }
                    };
                    let message = match crate::normalize::normalize_raw(topic, &envelope) {
                        Ok(message) => message,
                        Err(error) => {
                            tracing::error!(source = %envelope.source, %error, "dropping unnormalizable payload");
                            crate::MALFORMED.with_label_values(&[envelope.source.as_str()]).inc();
                            return bus::Outcome::Ack;
                        }
                    };
                    let payload = match serde_json::to_vec(&message) {
                        Ok(payload) => payload,
                        Err(error) => {
                            tracing::error!(%error, "failed to encode typed message");
                            return bus::Outcome::Ack;
                        }
                    };
                    match publisher.publish(&nq_qkey, &payload).await {
                        Ok(()) => {
                            PUBLISHED.with_label_values(&[&message.source, "update"]).inc();
                            bus::Outcome::Ack
                        }
                        Err(error) => {
                            tracing::warn!(%topic, %error, "publish failed; leaving message for redelivery");
                            bus::Outcome::Nack
                        }
                    }
                }
            },
            shutdown,
        )
        .await
}
