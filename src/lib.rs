//! # RabbitMQ Task Worker
//! A RabbitMQ worker that consumes Celery-style JSON tasks, hands them to a
//! handler one at a time and publishes results back under the task id, with
//! automatic reconnection and channel recovery.

pub mod amqp;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod pool;
pub mod task;
pub mod worker;

#[cfg(test)]
mod mock;

// Re-export key components for easy access
pub use amqp::AmqpConnectionProvider;
pub use broker::{BrokerChannel, BrokerConnection, ConnectionProvider};
pub use config::{ConnectionSettings, MalformedMessagePolicy, WorkerConfig};
pub use consumer::{BasicConsumerProvider, ConsumerProvider, MessageConsumer, RawDelivery};
pub use error::{ErrorKind, WorkerError};
pub use handler::{handler_fn, TaskHandler};
pub use pool::WorkerPool;
pub use task::{JobStatus, Task};
pub use worker::{Responder, Worker, WorkerState};
