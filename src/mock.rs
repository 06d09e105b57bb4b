//! In-memory broker for unit tests.
//!
//! Implements the broker traits over a shared, scripted state: tests publish
//! raw task bodies, inject connection failures, close channels or connections
//! from the "broker side" and inspect everything the worker declared,
//! acknowledged and published.

use crate::broker::{
    BrokerChannel, BrokerConnection, ConnectionProvider, ExchangeFlags, QueueFlags,
};
use crate::consumer::{BasicConsumerProvider, ConsumerProvider, MessageConsumer, RawDelivery};
use crate::error::WorkerError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub payload: String,
}

#[derive(Default)]
struct BrokerState {
    pending: VecDeque<Vec<u8>>,
    next_delivery_tag: u64,
    next_channel_id: u16,
    failing_connects: usize,
    failing_acks: usize,
    connect_attempts: usize,
    connections_opened: usize,
    channels_opened: usize,
    channels_aborted: usize,
    queues: Vec<(String, QueueFlags)>,
    exchanges: Vec<(String, ExchangeFlags)>,
    consumers: Vec<(String, String)>,
    recovers: Vec<bool>,
    acks: Vec<u64>,
    nacks: Vec<(u64, bool)>,
    published: Vec<Published>,
    open_channel: Option<Arc<AtomicBool>>,
    open_connection: Option<Arc<AtomicBool>>,
}

#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn providers(&self) -> (Arc<dyn ConnectionProvider>, Arc<dyn ConsumerProvider>) {
        (
            Arc::new(MockConnectionProvider {
                broker: self.clone(),
            }),
            Arc::new(BasicConsumerProvider),
        )
    }

    /// Enqueues a message on the worker's queue.
    pub fn publish_task(&self, body: impl Into<Vec<u8>>) {
        self.lock().pending.push_back(body.into());
    }

    /// Makes the next `count` connection attempts fail with an I/O error.
    pub fn fail_next_connects(&self, count: usize) {
        self.lock().failing_connects = count;
    }

    /// Makes the next `count` acks fail with an I/O error while the channel stays open.
    pub fn fail_next_acks(&self, count: usize) {
        self.lock().failing_acks = count;
    }

    /// Closes the most recent channel as if the broker had sent `channel.close`.
    pub fn close_channel(&self) {
        if let Some(open) = &self.lock().open_channel {
            open.store(false, Ordering::SeqCst);
        }
    }

    /// Drops the most recent connection, taking its channel with it.
    pub fn close_connection(&self) {
        let state = self.lock();
        for open in state.open_connection.iter().chain(state.open_channel.iter()) {
            open.store(false, Ordering::SeqCst);
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    pub fn channels_opened(&self) -> usize {
        self.lock().channels_opened
    }

    pub fn channels_aborted(&self) -> usize {
        self.lock().channels_aborted
    }

    pub fn queues(&self) -> Vec<(String, QueueFlags)> {
        self.lock().queues.clone()
    }

    pub fn exchanges(&self) -> Vec<(String, ExchangeFlags)> {
        self.lock().exchanges.clone()
    }

    pub fn consumers(&self) -> Vec<(String, String)> {
        self.lock().consumers.clone()
    }

    pub fn recovers(&self) -> Vec<bool> {
        self.lock().recovers.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.lock().acks.clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.lock().nacks.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    fn next_delivery(&self) -> Option<RawDelivery> {
        let mut state = self.lock();
        let body = state.pending.pop_front()?;
        state.next_delivery_tag += 1;
        Some(RawDelivery {
            delivery_tag: state.next_delivery_tag,
            body,
            redelivered: false,
            content_type: Some("application/json".to_string()),
        })
    }
}

fn broken_pipe(what: &str) -> WorkerError {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, what.to_string());
    WorkerError::from(lapin::Error::IOError(Arc::new(io)))
}

struct MockConnectionProvider {
    broker: MockBroker,
}

#[async_trait]
impl ConnectionProvider for MockConnectionProvider {
    fn address(&self) -> String {
        "mock:5672".to_string()
    }

    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, WorkerError> {
        let mut state = self.broker.lock();
        state.connect_attempts += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(broken_pipe("connection refused"));
        }

        let open = Arc::new(AtomicBool::new(true));
        state.connections_opened += 1;
        state.open_connection = Some(open.clone());
        Ok(Arc::new(MockConnection {
            broker: self.broker.clone(),
            open,
        }))
    }
}

struct MockConnection {
    broker: MockBroker,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, WorkerError> {
        if !self.is_open() {
            return Err(broken_pipe("connection closed"));
        }
        let mut state = self.broker.lock();
        let open = Arc::new(AtomicBool::new(true));
        state.next_channel_id += 1;
        state.channels_opened += 1;
        state.open_channel = Some(open.clone());
        Ok(Arc::new(MockChannel {
            id: state.next_channel_id,
            broker: self.broker.clone(),
            open,
        }))
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MockChannel {
    id: u16,
    broker: MockBroker,
    open: Arc<AtomicBool>,
}

impl MockChannel {
    fn ensure_open(&self) -> Result<(), WorkerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(broken_pipe("channel already closed"))
        }
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn abort(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.broker.lock().channels_aborted += 1;
    }

    async fn basic_qos(&self, _prefetch_count: u16) -> Result<(), WorkerError> {
        self.ensure_open()
    }

    async fn basic_recover(&self, requeue: bool) -> Result<(), WorkerError> {
        self.ensure_open()?;
        self.broker.lock().recovers.push(requeue);
        Ok(())
    }

    async fn queue_declare(&self, queue: &str, flags: QueueFlags) -> Result<(), WorkerError> {
        self.ensure_open()?;
        self.broker.lock().queues.push((queue.to_string(), flags));
        Ok(())
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        flags: ExchangeFlags,
    ) -> Result<(), WorkerError> {
        self.ensure_open()?;
        self.broker
            .lock()
            .exchanges
            .push((exchange.to_string(), flags));
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn MessageConsumer>, WorkerError> {
        self.ensure_open()?;
        self.broker
            .lock()
            .consumers
            .push((queue.to_string(), consumer_tag.to_string()));
        Ok(Box::new(MockConsumer {
            broker: self.broker.clone(),
            open: self.open.clone(),
        }))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), WorkerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if state.failing_acks > 0 {
            state.failing_acks -= 1;
            return Err(broken_pipe("ack lost in transit"));
        }
        state.acks.push(delivery_tag);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), WorkerError> {
        self.ensure_open()?;
        self.broker.lock().nacks.push((delivery_tag, requeue));
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        payload: &[u8],
    ) -> Result<(), WorkerError> {
        self.ensure_open()?;
        self.broker.lock().published.push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            content_type: content_type.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        });
        Ok(())
    }
}

struct MockConsumer {
    broker: MockBroker,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl MessageConsumer for MockConsumer {
    async fn next_message(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<RawDelivery>, WorkerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.open.load(Ordering::SeqCst) {
                return Err(WorkerError::channel_closed("mock channel closed"));
            }
            if let Some(delivery) = self.broker.next_delivery() {
                return Ok(Some(delivery));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}
