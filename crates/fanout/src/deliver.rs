//! Webhook delivery to one subscriber, modelled as an explicit state
//! machine: Pending → InFlight → Delivered | RetryScheduled | Failed, with
//! RetryScheduled looping back to InFlight on the next tick.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::IntCounterVec;
use reqwest::StatusCode;

use crate::collate::OutboundNotification;
use pnp_sql::SubscriptionRow;

lazy_static! {
    static ref DELIVERIES: IntCounterVec = prometheus::register_int_counter_vec!(
        "pnp_fanout_deliveries_total",
        "Terminal delivery outcomes, by state.",
        &["state"]
    )
    .unwrap();
    static ref DISABLED: IntCounterVec = prometheus::register_int_counter_vec!(
        "pnp_fanout_subscriptions_disabled_total",
        "Subscriptions disabled after repeated permanent failures.",
        &["subscription"]
    )
    .unwrap();
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    InFlight,
    Delivered,
    RetryScheduled,
    Failed,
}

#[derive(Debug)]
enum AttemptOutcome {
    Success,
    Retryable(String),
    Permanent(String),
}

pub struct Deliverer {
    client: reqwest::Client,
    pool: sqlx::PgPool,
    max_attempts: u32,
    /// Permanent failures tolerated before the subscription is disabled.
    failure_threshold: i32,
}

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CEILING: Duration = Duration::from_secs(60);
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(600);

impl Deliverer {
    pub fn new(
        client: reqwest::Client,
        pool: sqlx::PgPool,
        max_attempts: u32,
        failure_threshold: i32,
    ) -> Deliverer {
        Deliverer {
            client,
            pool,
            max_attempts,
            failure_threshold,
        }
    }

    /// Drive one delivery to a terminal state.
    #[tracing::instrument(skip_all, fields(subscription = %subscription.record_id))]
    pub async fn deliver(
        &self,
        subscription: &SubscriptionRow,
        notification: &OutboundNotification,
    ) -> DeliveryState {
        let mut retry = bus::RetryPolicy::new(
            self.max_attempts.saturating_sub(1),
            RETRY_BASE,
            RETRY_CEILING,
        );
        let mut state = DeliveryState::Pending;
        let mut permanent = false;

        loop {
            state = match state {
                DeliveryState::Pending | DeliveryState::RetryScheduled => DeliveryState::InFlight,

                DeliveryState::InFlight => match self.attempt(subscription, notification).await {
                    AttemptOutcome::Success => DeliveryState::Delivered,
                    AttemptOutcome::Retryable(reason) => match retry.next_backoff() {
                        Some(delay) => {
                            tracing::info!(%reason, ?delay, "delivery attempt failed; retry scheduled");
                            tokio::time::sleep(delay).await;
                            DeliveryState::RetryScheduled
                        }
                        None => {
                            tracing::warn!(%reason, "delivery retries exhausted");
                            DeliveryState::Failed
                        }
                    },
                    AttemptOutcome::Permanent(reason) => {
                        tracing::warn!(%reason, "delivery failed permanently");
                        permanent = true;
                        DeliveryState::Failed
                    }
                },

                DeliveryState::Delivered => {
                    DELIVERIES.with_label_values(&["delivered"]).inc();
                    if subscription.failures > 0 {
                        if let Err(error) =
                            pnp_sql::subscriptions::reset_failures(&self.pool, &subscription.record_id)
                                .await
                        {
                            tracing::warn!(%error, "failed to reset failure counter");
                        }
                    }
                    return DeliveryState::Delivered;
                }

                DeliveryState::Failed => {
                    DELIVERIES.with_label_values(&["failed"]).inc();
                    if permanent {
                        self.count_permanent_failure(subscription).await;
                    }
                    return DeliveryState::Failed;
                }
            };
        }
    }

    async fn attempt(
        &self,
        subscription: &SubscriptionRow,
        notification: &OutboundNotification,
    ) -> AttemptOutcome {
        let response = self
            .client
            .post(&subscription.target_address)
            .header(reqwest::header::AUTHORIZATION, &subscription.target_token)
            .timeout(DELIVERY_TIMEOUT)
            .json(notification)
            .send()
            .await;

        match response {
            Ok(response) => classify_status(response.status()),
            Err(error) => AttemptOutcome::Retryable(error.to_string()),
        }
    }

    async fn count_permanent_failure(&self, subscription: &SubscriptionRow) {
        match pnp_sql::subscriptions::record_failure(&self.pool, &subscription.record_id).await {
            Ok(failures) if failures >= self.failure_threshold => {
                tracing::warn!(
                    subscription = %subscription.record_id,
                    failures,
                    "failure threshold crossed; disabling subscription"
                );
                DISABLED
                    .with_label_values(&[subscription.record_id.as_str()])
                    .inc();
                if let Err(error) =
                    pnp_sql::subscriptions::disable(&self.pool, &subscription.record_id).await
                {
                    tracing::error!(%error, "failed to disable subscription");
                }
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "failed to record delivery failure"),
        }
    }
}

/// HTTP status classification: 2xx delivered, 5xx plus 408/429 retryable,
/// any other 4xx permanent.
fn classify_status(status: StatusCode) -> AttemptOutcome {
    if status.is_success() {
        AttemptOutcome::Success
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        AttemptOutcome::Retryable(format!("status {status}"))
    } else {
        AttemptOutcome::Permanent(format!("status {status}"))
    }
}
