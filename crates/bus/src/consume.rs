use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;

use crate::{BusArgs, Error, RetryPolicy};
use envelope::MasterKey;

/// Handler verdict for one delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Done with this message (including poison messages that were counted
    /// and dropped — redelivery would not help them).
    Ack,
    /// Processing failed transiently; the bus should redeliver.
    Nack,
}

enum SessionEnd {
    Shutdown,
    Lost { connected: bool, error: Error },
}

/// Consumer owns one queue binding and one channel per `serve` call.
/// Lost channels are re-established with exponential backoff, bounded at
/// the configured ceiling.
pub struct Consumer {
    config: BusArgs,
    master_key: MasterKey,
    queue: String,
    topics: Vec<String>,
    prefetch: u16,
}

impl Consumer {
    pub fn new(
        config: BusArgs,
        master_key: MasterKey,
        queue: impl Into<String>,
        topics: impl IntoIterator<Item = impl Into<String>>,
    ) -> Consumer {
        Consumer {
            config,
            master_key,
            queue: queue.into(),
            topics: topics.into_iter().map(Into::into).collect(),
            prefetch: 8,
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Consumer {
        self.prefetch = prefetch;
        self
    }

    /// Consume until `shutdown` resolves. Each delivery is opened and handed
    /// to `handler`; the returned Outcome drives ack/nack. Shutdown is
    /// observed between deliveries, never mid-handler, so in-flight work
    /// drains. Payloads that fail authentication are dropped (and logged):
    /// redelivering them cannot succeed.
    pub async fn serve<H, F, S>(&self, handler: H, shutdown: S) -> Result<(), Error>
    where
        H: Fn(Vec<u8>) -> F,
        F: Future<Output = Outcome>,
        S: Future<Output = ()>,
    {
        let mut reconnect =
            RetryPolicy::unbounded(Duration::from_millis(500), Duration::from_secs(30));
        tokio::pin!(shutdown);

        loop {
            let (connected, error) = match self.run_session(&handler, &mut shutdown).await {
                SessionEnd::Shutdown => {
                    tracing::info!(queue = %self.queue, "consumer shutting down");
                    return Ok(());
                }
                SessionEnd::Lost { connected, error } => (connected, error),
            };

            if connected {
                // The channel was live; restart the backoff curve.
                reconnect.reset();
            }
            let delay = reconnect
                .next_backoff()
                .expect("reconnect policy is unbounded");
            tracing::warn!(
                queue = %self.queue, %error, ?delay,
                "consumer channel lost; reconnecting"
            );
            tokio::select! {
                () = shutdown.as_mut() => return Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Runs one channel session until shutdown or failure.
    async fn run_session<H, F, S>(
        &self,
        handler: &H,
        shutdown: &mut Pin<&mut S>,
    ) -> SessionEnd
    where
        H: Fn(Vec<u8>) -> F,
        F: Future<Output = Outcome>,
        S: Future<Output = ()>,
    {
        let channel = tokio::select! {
            () = shutdown.as_mut() => return SessionEnd::Shutdown,
            result = self.open_channel() => match result {
                Ok(channel) => channel,
                Err(error) => {
                    return SessionEnd::Lost {
                        connected: false,
                        error,
                    }
                }
            },
        };
        let mut deliveries = match channel
            .basic_consume(
                &self.queue,
                &format!("pnp-{}", self.queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(deliveries) => deliveries,
            Err(error) => {
                return SessionEnd::Lost {
                    connected: false,
                    error: error.into(),
                }
            }
        };

        tracing::info!(queue = %self.queue, topics = ?self.topics, "consuming");

        loop {
            let next = tokio::select! {
                () = shutdown.as_mut() => return SessionEnd::Shutdown,
                next = deliveries.next() => next,
            };
            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(error)) => return lost(error.into()),
                None => {
                    return lost(
                        lapin::Error::InvalidChannelState(lapin::ChannelState::Closed).into(),
                    )
                }
            };

            // The handler and its ack run to completion, un-raced.
            let outcome = match self.master_key.open(&delivery.data) {
                Ok(plaintext) => handler(plaintext).await,
                Err(error) => {
                    tracing::error!(queue = %self.queue, %error, "dropping unopenable message");
                    Outcome::Ack
                }
            };
            let acked = match outcome {
                Outcome::Ack => delivery.ack(BasicAckOptions::default()).await,
                Outcome::Nack => {
                    delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await
                }
            };
            if let Err(error) = acked {
                return lost(error.into());
            }
        }
    }

    async fn open_channel(&self) -> Result<Channel, Error> {
        let connection = self.config.connect().await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;
        channel
            .exchange_declare(
                &self.config.exchange,
                self.config.exchange_kind(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        for topic in &self.topics {
            channel
                .queue_bind(
                    &self.queue,
                    &self.config.exchange,
                    topic,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
        Ok(channel)
    }
}

fn lost(error: Error) -> SessionEnd {
    SessionEnd::Lost {
        connected: true,
        error,
    }
}
