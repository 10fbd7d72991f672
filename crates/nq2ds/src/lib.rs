//! NQ2DS: the queue-to-data-store consumer. Unseals typed messages,
//! applies them under the ordering rules in `apply`, and emits a
//! downstream event for every commit that changed something.

pub mod apply;
pub mod retention;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lazy_static::lazy_static;
use models::{FanoutMessage, IngestMessage};
use prometheus::{IntCounter, IntCounterVec};

lazy_static! {
    static ref APPLIED: IntCounterVec = prometheus::register_int_counter_vec!(
        "pnp_nq2ds_rows_total",
        "Row decisions taken by the consumer, by outcome.",
        &["outcome"]
    )
    .unwrap();
    static ref MALFORMED: IntCounter = prometheus::register_int_counter!(
        "pnp_nq2ds_malformed_total",
        "Messages dropped because they could not be decoded or expanded."
    )
    .unwrap();
    static ref EMITTED: IntCounter = prometheus::register_int_counter!(
        "pnp_nq2ds_emitted_total",
        "Downstream fan-out events emitted after a mutating commit."
    )
    .unwrap();
    static ref EMIT_FAILED: IntCounter = prometheus::register_int_counter!(
        "pnp_nq2ds_emit_failed_total",
        "Downstream emissions abandoned after exhausting retries."
    )
    .unwrap();
}

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(2);
const RETRY_CEILING: Duration = Duration::from_secs(30);

pub struct Worker {
    pub pool: sqlx::PgPool,
    pub publisher: Arc<bus::Publisher>,
    /// When set, ServiceNow records are not persisted locally; their
    /// downstream event is still emitted.
    pub bypass_snow_storage: bool,
}

impl Worker {
    /// Handle one opened bus message. Ack outcomes cover both success and
    /// poison messages; Nack asks the bus to redeliver after a transient
    /// database failure survived all retries.
    pub async fn handle(&self, plaintext: Vec<u8>) -> bus::Outcome {
        let message: IngestMessage = match serde_json::from_slice(&plaintext) {
            Ok(message) => message,
            Err(error) => {
                tracing::error!(%error, "dropping undecodable typed message");
                MALFORMED.inc();
                return bus::Outcome::Ack;
            }
        };

        if self.bypass_snow_storage && message.source == "servicenow" {
            tracing::debug!(source_id = %message.source_id, "bypassing local storage");
            self.emit(&message).await;
            return bus::Outcome::Ack;
        }

        let mut retry = bus::RetryPolicy::new(RETRY_ATTEMPTS, RETRY_BASE, RETRY_CEILING);
        loop {
            match apply::apply_message(&self.pool, &message, Utc::now()).await {
                Ok(report) => {
                    for outcome in &report.outcomes {
                        APPLIED.with_label_values(&[outcome]).inc();
                    }
                    if report.outdated > 0 {
                        tracing::info!(
                            source = %message.source,
                            source_id = %message.source_id,
                            outdated = report.outdated,
                            "dropped outdated rows"
                        );
                    }
                    if report.changed.is_some() {
                        self.emit(&message).await;
                    }
                    return bus::Outcome::Ack;
                }
                Err(error) => {
                    let transient = error
                        .downcast_ref::<sqlx::Error>()
                        .is_some_and(pnp_sql::is_transient);
                    if !transient {
                        tracing::error!(
                            source_id = %message.source_id, error = format!("{error:#}"),
                            "dropping unprocessable message"
                        );
                        MALFORMED.inc();
                        return bus::Outcome::Ack;
                    }
                    match retry.next_backoff() {
                        Some(delay) => {
                            tracing::warn!(
                                source_id = %message.source_id, ?delay, error = format!("{error:#}"),
                                "transient database failure; retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            tracing::error!(
                                source_id = %message.source_id,
                                "database retries exhausted; leaving message for redelivery"
                            );
                            return bus::Outcome::Nack;
                        }
                    }
                }
            }
        }
    }

    /// Post-commit emission onto the fan-out topic. Best-effort with the
    /// same backoff schedule as the writes; a persistent failure is logged
    /// and counted, never unwound.
    async fn emit(&self, message: &IngestMessage) {
        let rows = match message.to_notifications(Utc::now()) {
            Ok(rows) => rows,
            Err(_) => return,
        };
        let Some(first) = rows.first() else {
            return;
        };
        let event = FanoutMessage::from_notification(first, message.kind);
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(%error, "failed to encode fan-out event");
                EMIT_FAILED.inc();
                return;
            }
        };

        let mut retry = bus::RetryPolicy::new(RETRY_ATTEMPTS, RETRY_BASE, RETRY_CEILING);
        loop {
            match self
                .publisher
                .publish(bus::topic::NOTIFICATION, &payload)
                .await
            {
                Ok(()) => {
                    EMITTED.inc();
                    return;
                }
                Err(error) => match retry.next_backoff() {
                    Some(delay) => {
                        tracing::warn!(%error, ?delay, "fan-out emission failed; retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(
                            source_id = %message.source_id, %error,
                            "fan-out emission abandoned"
                        );
                        EMIT_FAILED.inc();
                        return;
                    }
                },
            }
        }
    }
}
