//! `lapin`-backed implementations of the broker traits.

use crate::broker::{
    BrokerChannel, BrokerConnection, ConnectionProvider, ExchangeFlags, ExchangeType, QueueFlags,
};
use crate::config::ConnectionSettings;
use crate::consumer::{MessageConsumer, RawDelivery};
use crate::error::WorkerError;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRecoverOptions, ExchangeDeclareOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use std::sync::Arc;
use std::time::Duration;

const REPLY_SUCCESS: u16 = 200;

/// Opens a fresh `lapin` connection per call from fixed [`ConnectionSettings`].
#[derive(Debug, Clone)]
pub struct AmqpConnectionProvider {
    settings: ConnectionSettings,
}

impl AmqpConnectionProvider {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    fn uri(&self) -> AMQPUri {
        let mut uri = AMQPUri::default();
        uri.authority.host = self.settings.host.clone();
        uri.authority.port = self.settings.port;
        uri.authority.userinfo.username = self.settings.username.clone();
        uri.authority.userinfo.password = self.settings.password.clone();
        uri.vhost = self.settings.vhost.clone();
        uri
    }
}

#[async_trait]
impl ConnectionProvider for AmqpConnectionProvider {
    fn address(&self) -> String {
        self.settings.address()
    }

    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, WorkerError> {
        let connection = Connection::connect_uri(self.uri(), ConnectionProperties::default()).await?;
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

pub struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, WorkerError> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.inner.close(REPLY_SUCCESS, "worker closed").await?;
        Ok(())
    }
}

pub struct AmqpChannel {
    inner: Channel,
}

impl AmqpChannel {
    fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
        match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u16 {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn abort(&self) {
        if !self.is_open() {
            return;
        }
        if let Err(e) = self.inner.close(REPLY_SUCCESS, "channel replaced").await {
            log::debug!("Ignoring error while aborting channel {}: {}", self.id(), e);
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), WorkerError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_recover(&self, requeue: bool) -> Result<(), WorkerError> {
        self.inner
            .basic_recover(BasicRecoverOptions { requeue })
            .await?;
        Ok(())
    }

    async fn queue_declare(&self, queue: &str, flags: QueueFlags) -> Result<(), WorkerError> {
        self.inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: flags.durable,
                    exclusive: flags.exclusive,
                    auto_delete: flags.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        flags: ExchangeFlags,
    ) -> Result<(), WorkerError> {
        self.inner
            .exchange_declare(
                exchange,
                Self::exchange_kind(flags.kind),
                ExchangeDeclareOptions {
                    durable: flags.durable,
                    auto_delete: flags.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn MessageConsumer>, WorkerError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(Box::new(AmqpMessageConsumer { inner: consumer }))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), WorkerError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), WorkerError> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        payload: &[u8],
    ) -> Result<(), WorkerError> {
        let properties = BasicProperties::default().with_content_type(content_type.into());
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?;
        Ok(())
    }
}

/// Wraps the `lapin` consumer stream behind a bounded poll.
pub struct AmqpMessageConsumer {
    inner: Consumer,
}

#[async_trait]
impl MessageConsumer for AmqpMessageConsumer {
    async fn next_message(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<RawDelivery>, WorkerError> {
        match tokio::time::timeout(timeout, self.inner.next()).await {
            Err(_elapsed) => Ok(None),
            Ok(None) => Err(WorkerError::channel_closed(format!(
                "consumer '{}' was cancelled",
                self.inner.tag()
            ))),
            // Any error on the stream means the consumer is gone for good.
            Ok(Some(Err(e))) => Err(WorkerError::channel_closed(e.to_string())),
            Ok(Some(Ok(delivery))) => Ok(Some(RawDelivery {
                delivery_tag: delivery.delivery_tag,
                content_type: delivery
                    .properties
                    .content_type()
                    .as_ref()
                    .map(|ct| ct.as_str().to_owned()),
                redelivered: delivery.redelivered,
                body: delivery.data,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_carries_every_setting() {
        let provider = AmqpConnectionProvider::new(ConnectionSettings::new(
            "platform", 5673, "loadui", "secret", "jobs",
        ));
        let uri = provider.uri();

        assert_eq!(uri.authority.host, "platform");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "loadui");
        assert_eq!(uri.authority.userinfo.password, "secret");
        assert_eq!(uri.vhost, "jobs");
        assert_eq!(provider.address(), "platform:5673");
    }

    #[test]
    fn direct_exchanges_map_onto_the_lapin_kind() {
        assert!(matches!(
            AmqpChannel::exchange_kind(ExchangeType::Direct),
            ExchangeKind::Direct
        ));
    }
}
