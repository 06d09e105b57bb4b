//! Broker seams: the connection, channel and provider traits the worker talks to.
//!
//! The production implementations live in [`crate::amqp`] and wrap `lapin`.
//! Keeping the worker behind these traits lets tests drive it with an
//! in-memory broker.

use crate::consumer::MessageConsumer;
use crate::error::WorkerError;
use async_trait::async_trait;
use std::sync::Arc;

/// Flags a queue is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFlags {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// AMQP exchange types the worker declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Direct,
}

/// Type and flags an exchange is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeFlags {
    pub kind: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Opens connections to the broker.
///
/// A provider may be shared by several workers; every call must hand out an
/// independent connection.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// `host:port` of the broker, for logging.
    fn address(&self) -> String;

    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, WorkerError>;
}

/// A single logical link to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// `false` once the broker or the network has closed the connection.
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, WorkerError>;

    async fn close(&self) -> Result<(), WorkerError>;
}

/// A channel on a [`BrokerConnection`]: everything that publishes, consumes or
/// acknowledges goes through one of these.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    /// `false` once the channel has been closed by either side.
    fn is_open(&self) -> bool;

    /// Closes the channel, ignoring errors. Used before a replacement is opened.
    async fn abort(&self);

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), WorkerError>;

    /// Asks the broker to redeliver every unacknowledged message of the session.
    async fn basic_recover(&self, requeue: bool) -> Result<(), WorkerError>;

    async fn queue_declare(&self, queue: &str, flags: QueueFlags) -> Result<(), WorkerError>;

    async fn exchange_declare(
        &self,
        exchange: &str,
        flags: ExchangeFlags,
    ) -> Result<(), WorkerError>;

    /// Starts consuming `queue` with manual acknowledgement.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn MessageConsumer>, WorkerError>;

    /// Acknowledges exactly one delivery (`multiple = false`).
    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), WorkerError>;

    /// Negatively acknowledges exactly one delivery.
    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), WorkerError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        payload: &[u8],
    ) -> Result<(), WorkerError>;
}
