use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use tokio::sync::Mutex;

use crate::{BusArgs, Error};
use envelope::MasterKey;

/// Publisher seals payloads and routes them through the configured exchange.
/// It may be shared across tasks; the underlying channel is re-established
/// on demand, trying the fallback endpoint when the primary refuses.
pub struct Publisher {
    config: BusArgs,
    master_key: MasterKey,
    channel: Mutex<Option<Channel>>,
}

impl Publisher {
    pub fn new(config: BusArgs, master_key: MasterKey) -> Publisher {
        Publisher {
            config,
            master_key,
            channel: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BusArgs {
        &self.config
    }

    /// Seal `plaintext` and publish it under `topic`. Payload failures are
    /// surfaced immediately; a transport failure tears down the channel and
    /// is retried once against the endpoint list before surfacing.
    #[tracing::instrument(level = "debug", skip(self, plaintext), fields(bytes = plaintext.len()))]
    pub async fn publish(&self, topic: &str, plaintext: &[u8]) -> Result<(), Error> {
        if !self.config.enabled {
            tracing::debug!(%topic, "messages disabled; dropping publish");
            return Ok(());
        }
        let sealed = self.master_key.seal(plaintext).map_err(Error::Seal)?;

        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            match basic_publish(channel, &self.config.exchange, topic, &sealed).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    tracing::warn!(%topic, %error, "publish failed; reconnecting");
                    *guard = None;
                }
            }
        }

        let channel = self.open_channel().await?;
        basic_publish(&channel, &self.config.exchange, topic, &sealed).await?;
        *guard = Some(channel);
        Ok(())
    }

    async fn open_channel(&self) -> Result<Channel, Error> {
        let connection = self.config.connect().await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
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
        Ok(channel)
    }
}

async fn basic_publish(
    channel: &Channel,
    exchange: &str,
    topic: &str,
    sealed: &[u8],
) -> Result<(), Error> {
    let confirmation = channel
        .basic_publish(
            exchange,
            topic,
            BasicPublishOptions::default(),
            sealed,
            BasicProperties::default().with_delivery_mode(2),
        )
        .await?
        .await?;

    match confirmation {
        Confirmation::Nack(_) => Err(Error::Unconfirmed),
        _ => Ok(()),
    }
}
