//! The task worker engine: lifecycle, consume loop and connection recovery.
//!
//! A [`Worker`] owns at most one broker connection and one channel. Once
//! started it runs a single loop on a spawned tokio task which polls the queue,
//! parses each delivery into a [`Task`], awaits the registered [`TaskHandler`]
//! and acknowledges the delivery. Broker failures never end the loop: the
//! worker reconnects and keeps going until [`Worker::stop`] is called.

use crate::amqp::AmqpConnectionProvider;
use crate::broker::{
    BrokerChannel, BrokerConnection, ConnectionProvider, ExchangeFlags, ExchangeType, QueueFlags,
};
use crate::config::{ConnectionSettings, MalformedMessagePolicy, WorkerConfig};
use crate::consumer::{BasicConsumerProvider, ConsumerProvider, MessageConsumer};
use crate::error::{ErrorKind, WorkerError};
use crate::handler::TaskHandler;
use crate::task::{self, JobStatus, Task};
use chrono::Utc;
use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

/// Lifecycle of a [`Worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Created, never started.
    Idle,
    Starting,
    /// Establishing the first connection.
    Connecting,
    Consuming,
    /// Waiting to reconnect after the broker shut the channel down.
    Recovering,
    Stopping,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Starting => "starting",
            WorkerState::Connecting => "connecting",
            WorkerState::Consuming => "consuming",
            WorkerState::Recovering => "recovering",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Connection and channel currently owned by the worker.
#[derive(Default)]
struct Link {
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
}

/// A channel together with the consumer reading from it.
struct Session {
    channel: Arc<dyn BrokerChannel>,
    consumer: Box<dyn MessageConsumer>,
}

struct Shared {
    config: WorkerConfig,
    connection_provider: Arc<dyn ConnectionProvider>,
    consumer_provider: Arc<dyn ConsumerProvider>,
    handler: RwLock<Option<Arc<dyn TaskHandler>>>,
    // Only the consume loop replaces the link; everyone else reads it.
    link: RwLock<Link>,
    state: watch::Sender<WorkerState>,
    running: watch::Sender<bool>,
}

/// Consumes tasks from one queue and publishes responses to one exchange.
///
/// Tasks are handled strictly one at a time, in delivery order: the handler is
/// awaited on the consume loop and the next message is only pulled once it
/// returns. For parallelism run several workers, each with its own
/// connection (see [`WorkerPool`](crate::pool::WorkerPool)).
pub struct Worker {
    shared: Arc<Shared>,
}

impl Worker {
    /// Bounded wait for the next delivery.
    pub const POLLING_TIMEOUT: Duration = Duration::from_millis(500);
    /// Pause between attempts of the initial connection.
    pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
    /// Pause before reconnecting after a shutdown signal.
    pub const RECOVERY_DELAY: Duration = Duration::from_millis(2000);
    /// Bound for [`Worker::wait_until_job_completed`].
    pub const JOB_COMPLETION_TIMEOUT: Duration = Duration::from_secs(180);
    pub const JOB_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const QUEUE_FLAGS: QueueFlags = QueueFlags {
        durable: true,
        exclusive: false,
        auto_delete: false,
    };
    pub const RESPONSE_EXCHANGE_FLAGS: ExchangeFlags = ExchangeFlags {
        kind: ExchangeType::Direct,
        durable: false,
        auto_delete: false,
    };
    pub const RESPONSE_CONTENT_TYPE: &'static str = "application/json";
    /// `basic.recover` asks for redelivery of unacknowledged messages.
    pub const RECOVER_REQUEUE: bool = true;

    /// Creates a worker talking to a RabbitMQ broker through `lapin`.
    pub fn new(settings: ConnectionSettings, config: WorkerConfig) -> Self {
        Self::with_providers(
            Arc::new(AmqpConnectionProvider::new(settings)),
            Arc::new(BasicConsumerProvider),
            config,
        )
    }

    /// Creates a worker on injected providers.
    pub fn with_providers(
        connection_provider: Arc<dyn ConnectionProvider>,
        consumer_provider: Arc<dyn ConsumerProvider>,
        config: WorkerConfig,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        let (running, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                connection_provider,
                consumer_provider,
                handler: RwLock::new(None),
                link: RwLock::new(Link::default()),
                state,
                running,
            }),
        }
    }

    /// Registers the handler every parsed task is dispatched to, replacing any
    /// previous one. Without a handler, tasks are acknowledged and dropped.
    pub async fn set_task_handler(&self, handler: Arc<dyn TaskHandler>) {
        log::info!(
            "Registered task handler '{}' for queue '{}'",
            handler.handler_name(),
            self.shared.config.queue_name
        );
        *self.shared.handler.write().await = Some(handler);
    }

    pub async fn task_handler(&self) -> Option<Arc<dyn TaskHandler>> {
        self.shared.handler.read().await.clone()
    }

    /// Spawns the consume loop on the current tokio runtime and returns
    /// immediately.
    ///
    /// A worker can be started once; starting it again is an
    /// [`WorkerError::IllegalState`].
    pub fn start(&self) -> Result<&Self, WorkerError> {
        let claimed = self.shared.state.send_if_modified(|state| {
            if *state == WorkerState::Idle {
                *state = WorkerState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(WorkerError::IllegalState(format!(
                "cannot start a worker that is {}",
                self.state()
            )));
        }

        log::info!(
            "Starting worker for queue '{}' on {}",
            self.shared.config.queue_name,
            self.shared.connection_provider.address()
        );
        self.shared.running.send_replace(true);
        tokio::spawn(self.shared.clone().run());
        Ok(self)
    }

    /// Waits until the consume loop has started (it may still be connecting).
    pub async fn wait_until_running(&self) -> &Self {
        self.wait_for_state(|state| !matches!(state, WorkerState::Idle | WorkerState::Starting))
            .await;
        self
    }

    /// Waits until the worker consumes from its queue, or has stopped.
    pub async fn wait_until_consuming(&self) -> &Self {
        self.wait_for_state(|state| {
            matches!(
                state,
                WorkerState::Consuming | WorkerState::Stopping | WorkerState::Stopped
            )
        })
        .await;
        self
    }

    /// Asks the consume loop to exit and returns immediately.
    ///
    /// The loop notices within one poll timeout. A handler that is already
    /// running is not interrupted.
    pub fn stop(&self) -> &Self {
        self.shared.running.send_replace(false);
        self.shared.state.send_if_modified(|state| match *state {
            WorkerState::Idle => {
                *state = WorkerState::Stopped;
                true
            }
            WorkerState::Stopping | WorkerState::Stopped => false,
            _ => {
                *state = WorkerState::Stopping;
                true
            }
        });
        self
    }

    /// Waits until the consume loop has exited. Returns at once for a worker
    /// that was never started.
    pub async fn wait_until_terminated(&self) -> &Self {
        self.wait_for_state(|state| matches!(state, WorkerState::Idle | WorkerState::Stopped))
            .await;
        self
    }

    async fn wait_for_state(&self, reached: impl FnMut(&WorkerState) -> bool) {
        let mut state = self.shared.state.subscribe();
        // The sender lives in `shared`, so this only returns once `reached` holds.
        let _ = state.wait_for(reached).await;
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.borrow()
    }

    /// `true` between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Publishes `payload` for task `id` on the response exchange.
    ///
    /// Best effort: failures are logged, never returned.
    pub async fn respond(&self, id: &str, payload: &str) {
        self.shared.respond(id, payload).await;
    }

    /// A cloneable handle that can publish responses through this worker.
    pub fn responder(&self) -> Responder {
        Responder {
            shared: self.shared.clone(),
        }
    }

    /// Waits for `task` to leave the in-progress state, up to the configured
    /// job completion timeout, and revokes it if it does not.
    ///
    /// Stopping the worker interrupts the wait; that is logged as a warning and
    /// the task is revoked as well.
    pub async fn wait_until_job_completed(&self, task: &Task) -> JobStatus {
        let config = &self.shared.config;
        let wait =
            task::wait_until_completed(task, config.job_completion_timeout, config.job_poll_interval);
        if !self.is_running() {
            return wait.await;
        }

        tokio::select! {
            status = wait => status,
            _ = self.shared.stopped() => {
                log::warn!("Interrupted while waiting for task {} to complete", task.id());
                if task.revoke() {
                    log::warn!("Revoked task {} after interrupted wait", task.id());
                }
                task.status()
            }
        }
    }

    /// Aborts the channel and closes the connection. Meant for after
    /// [`Worker::wait_until_terminated`]; a running worker would just reconnect.
    pub async fn close(&self) {
        let mut link = self.shared.link.write().await;
        if let Some(channel) = link.channel.take() {
            channel.abort().await;
        }
        if let Some(connection) = link.connection.take() {
            if connection.is_open() {
                if let Err(e) = connection.close().await {
                    log::warn!("Error while closing broker connection: {}", e);
                }
            }
        }
    }

    pub async fn connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.shared.link.read().await.connection.clone()
    }

    pub async fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.shared.link.read().await.channel.clone()
    }

    pub fn queue(&self) -> &str {
        &self.shared.config.queue_name
    }

    pub fn exchange(&self) -> &str {
        &self.shared.config.exchange_name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    pub fn connection_provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.shared.connection_provider
    }

    pub fn consumer_provider(&self) -> &Arc<dyn ConsumerProvider> {
        &self.shared.consumer_provider
    }
}

/// Publishes responses through the worker that produced a task.
#[derive(Clone)]
pub struct Responder {
    shared: Arc<Shared>,
}

impl Responder {
    /// See [`Worker::respond`].
    pub async fn respond(&self, id: &str, payload: &str) {
        self.shared.respond(id, payload).await;
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("exchange", &self.shared.config.exchange_name)
            .finish()
    }
}

/// Marks the worker stopped however the loop ends, panics included.
struct TerminationGuard(Arc<Shared>);

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        self.0.running.send_replace(false);
        self.0.state.send_replace(WorkerState::Stopped);
    }
}

impl Shared {
    fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Moves to `next` unless a stop has already been requested.
    fn set_state(&self, next: WorkerState) {
        self.state.send_if_modified(|state| {
            if matches!(state, WorkerState::Stopping | WorkerState::Stopped) || *state == next {
                return false;
            }
            log::debug!(
                "Worker for queue '{}': {} -> {}",
                self.config.queue_name,
                state,
                next
            );
            *state = next;
            true
        });
    }

    /// Sleeps for `delay` or until stopped. Returns whether the worker still runs.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.stopped() => {}
        }
        self.is_running()
    }

    /// Resolves once a stop has been requested.
    async fn stopped(&self) {
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|running| !running).await;
    }

    async fn run(self: Arc<Self>) {
        let _terminated = TerminationGuard(self.clone());

        self.set_state(WorkerState::Connecting);
        let mut session = self.initial_connection().await;
        if session.is_some() {
            self.set_state(WorkerState::Consuming);
        }

        while self.is_running() {
            log::debug!("Waiting for tasks on queue '{}'", self.config.queue_name);
            let polled = match session.as_mut() {
                Some(active) => self.poll(active).await,
                None => Err(WorkerError::NotConnected),
            };

            let Err(err) = polled else { continue };
            match err.kind() {
                ErrorKind::Transport => log::warn!("Lost RabbitMQ connection: {}", err),
                ErrorKind::Shutdown => {
                    drop(session.take());
                    session = self.recover(err).await;
                }
                _ => log::error!(
                    "Critical error, unable to inform the caller about failure: {}",
                    err
                ),
            }
        }

        log::info!("Worker for queue '{}' stopped", self.config.queue_name);
    }

    /// Connects until it works or the worker is stopped.
    async fn initial_connection(&self) -> Option<Session> {
        while self.is_running() {
            match self.connect().await {
                Ok(session) => return Some(session),
                Err(err) => {
                    log::error!(
                        "Unable to connect to {}, retrying in {:?}: {}",
                        self.connection_provider.address(),
                        self.config.connect_retry_delay,
                        err
                    );
                    self.pause(self.config.connect_retry_delay).await;
                }
            }
        }
        None
    }

    async fn recover(&self, cause: WorkerError) -> Option<Session> {
        self.set_state(WorkerState::Recovering);
        log::debug!("Attempting reconnection after: {}", cause);
        if !self.pause(self.config.recovery_delay).await {
            return None;
        }

        log::debug!("Attempting connection recovery");
        match self.connect().await {
            Ok(session) => {
                log::info!(
                    "Recovered consumer on queue '{}' (channel {})",
                    self.config.queue_name,
                    session.channel.id()
                );
                self.set_state(WorkerState::Consuming);
                Some(session)
            }
            Err(err) => {
                log::error!("Attempted recovery failed. Reason: {}", err);
                None
            }
        }
    }

    /// Replaces the channel (and the connection, if it died), redeclares the
    /// queue and starts a fresh consumer. Does not retry.
    async fn connect(&self) -> Result<Session, WorkerError> {
        log::debug!(
            "Connecting to RabbitMQ broker: {}",
            self.connection_provider.address()
        );
        let mut link = self.link.write().await;

        if let Some(channel) = link.channel.take() {
            channel.abort().await;
        }

        let reusable = link
            .connection
            .as_ref()
            .filter(|connection| connection.is_open())
            .cloned();
        let connection = match reusable {
            Some(connection) => connection,
            None => {
                if link.connection.take().is_some() {
                    log::debug!("Existing broker connection is closed, opening a new one");
                }
                let connection = self.connection_provider.connect().await?;
                link.connection = Some(connection.clone());
                connection
            }
        };

        let channel = connection.create_channel().await?;
        link.channel = Some(channel.clone());

        channel.basic_recover(Worker::RECOVER_REQUEUE).await?;
        channel.basic_qos(self.config.prefetch_count).await?;
        channel
            .queue_declare(&self.config.queue_name, Worker::QUEUE_FLAGS)
            .await?;
        let consumer = self
            .consumer_provider
            .build_consumer(&channel, &self.config.queue_name, &self.config.consumer_tag)
            .await?;

        Ok(Session { channel, consumer })
    }

    /// Pulls at most one delivery and settles it.
    async fn poll(self: &Arc<Self>, session: &mut Session) -> Result<(), WorkerError> {
        if !session.channel.is_open() {
            return Err(WorkerError::channel_closed(format!(
                "channel {} is no longer open",
                session.channel.id()
            )));
        }

        let delivery = match session.consumer.next_message(self.config.poll_timeout).await? {
            Some(delivery) => delivery,
            None => return Ok(()),
        };
        let tag = delivery.delivery_tag;
        log::debug!(
            "Received message {} ({}): {}",
            tag,
            delivery.content_type.as_deref().unwrap_or("no content type"),
            String::from_utf8_lossy(&delivery.body)
        );
        if delivery.redelivered {
            log::info!("Message {} is a redelivery", tag);
        }

        match Task::from_json(&delivery.body) {
            Ok(task) => {
                let task = task.attach(Responder {
                    shared: self.clone(),
                });
                self.dispatch(task).await;
                session.channel.basic_ack(tag).await?;
            }
            Err(err) => {
                log::error!(
                    "Message {} could not be parsed, is it the correct format? Supported formats: [JSON]. Reason: {}",
                    tag,
                    err
                );
                match self.config.malformed_policy {
                    MalformedMessagePolicy::Acknowledge => session.channel.basic_ack(tag).await?,
                    MalformedMessagePolicy::Reject => {
                        session.channel.basic_nack(tag, false).await?
                    }
                }
            }
        }
        Ok(())
    }

    /// Runs the handler to completion. Its failures end here.
    async fn dispatch(&self, task: Task) {
        let handler = self.handler.read().await.clone();
        let Some(handler) = handler else {
            log::warn!(
                "No task handler registered, acknowledging task {} ({}) without running it",
                task.id(),
                task.name()
            );
            return;
        };

        if task.is_expired_at(Utc::now()) {
            task.revoke();
            log::warn!(
                "Task {} ({}) expired at {:?}, revoking it without running it",
                task.id(),
                task.name(),
                task.expires()
            );
            return;
        }

        log::info!(
            "Handling task {} ({}) with '{}'",
            task.id(),
            task.name(),
            handler.handler_name()
        );
        let outcome = AssertUnwindSafe(handler.handle(task.clone()))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => {
                task.mark_completed();
                log::debug!("Task {} handled, now {}", task.id(), task.status());
                return;
            }
            Ok(Err(err)) => err.to_string(),
            Err(panic) => format!("handler panicked: {}", panic_message(&*panic)),
        };
        task.mark_failed();
        log::error!(
            "Critical error, unable to inform the caller about failure of task {}: {}",
            task.id(),
            failure
        );
    }

    async fn respond(&self, id: &str, payload: &str) {
        log::debug!("Trying to respond {} for task {}", payload, id);
        let routing_key = task::routing_key(id);
        let channel = self.link.read().await.channel.clone();

        let published = match channel {
            Some(channel) => self.publish(channel.as_ref(), &routing_key, payload).await,
            None => Err(WorkerError::NotConnected),
        };
        if let Err(err) = published {
            log::error!("Unable to respond to task {}: {}", id, err);
        }
    }

    async fn publish(
        &self,
        channel: &dyn BrokerChannel,
        routing_key: &str,
        payload: &str,
    ) -> Result<(), WorkerError> {
        channel
            .exchange_declare(&self.config.exchange_name, Worker::RESPONSE_EXCHANGE_FLAGS)
            .await?;
        channel
            .basic_publish(
                &self.config.exchange_name,
                routing_key,
                Worker::RESPONSE_CONTENT_TYPE,
                payload.as_bytes(),
            )
            .await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        return message;
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.as_str();
    }
    "unknown panic"
}
