//! Message consumers and the provider that builds them for a channel.

use crate::broker::BrokerChannel;
use crate::error::WorkerError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// One message as handed over by the broker, before any parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    /// Broker-assigned handle used to acknowledge this message and nothing else.
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
    pub content_type: Option<String>,
}

/// A pollable stream of deliveries bound to one channel.
///
/// It becomes useless once its channel closes and must be rebuilt with the
/// channel.
#[async_trait]
pub trait MessageConsumer: Send {
    /// Waits up to `timeout` for the next delivery.
    ///
    /// Returns `Ok(None)` if nothing arrived in time. An error means the
    /// consumer is dead.
    async fn next_message(&mut self, timeout: Duration)
        -> Result<Option<RawDelivery>, WorkerError>;
}

/// Builds the consumer a worker reads from after every (re)connect.
#[async_trait]
pub trait ConsumerProvider: Send + Sync {
    async fn build_consumer(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn MessageConsumer>, WorkerError>;
}

/// Plain `basic.consume` on the worker's queue with manual acknowledgement.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicConsumerProvider;

#[async_trait]
impl ConsumerProvider for BasicConsumerProvider {
    async fn build_consumer(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn MessageConsumer>, WorkerError> {
        let consumer = channel.basic_consume(queue, consumer_tag).await?;
        log::info!(
            "Consumer started with tag '{}' on channel {}. Waiting for tasks...",
            consumer_tag,
            channel.id()
        );
        Ok(consumer)
    }
}
