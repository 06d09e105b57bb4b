//! Worker and broker connection configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue Celery producers publish to unless told otherwise.
pub const DEFAULT_QUEUE: &str = "celery";
/// Exchange Celery's AMQP result backend listens on.
pub const DEFAULT_RESULT_EXCHANGE: &str = "celeryresults";

/// What to do with a delivery whose payload is not a valid task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedMessagePolicy {
    /// Acknowledge the delivery, dropping it from the queue.
    #[default]
    Acknowledge,
    /// Negatively acknowledge without requeueing, so a dead-letter exchange
    /// configured on the queue can pick it up.
    Reject,
}

/// Parameters needed to open a connection to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
}

impl ConnectionSettings {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        vhost: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            vhost: vhost.into(),
        }
    }

    /// Reads `BROKER_HOST`, `BROKER_PORT`, `BROKER_USER`, `BROKER_PASSWORD` and
    /// `BROKER_VHOST`, falling back to the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        Self {
            port: var("BROKER_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            host: var("BROKER_HOST").unwrap_or(defaults.host),
            username: var("BROKER_USER").unwrap_or(defaults.username),
            password: var("BROKER_PASSWORD").unwrap_or(defaults.password),
            vhost: var("BROKER_VHOST").unwrap_or(defaults.vhost),
        }
    }

    /// `host:port`, used in log lines. Never includes credentials.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::new("localhost", 5672, "guest", "guest", "/")
    }
}

/// Configuration for a [`Worker`](crate::worker::Worker).
///
/// Use the `WorkerConfig::builder()` method to construct this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// The queue tasks are consumed from.
    pub queue_name: String,
    /// The exchange responses are published to.
    pub exchange_name: String,
    /// Consumer tag used for `basic.consume` on the queue.
    pub consumer_tag: String,
    /// The number of unacknowledged messages the broker may push (QoS prefetch count).
    pub prefetch_count: u16,
    /// How long a single poll waits for the next delivery.
    pub poll_timeout: Duration,
    /// Pause between failed attempts of the initial connection.
    pub connect_retry_delay: Duration,
    /// Pause before reconnecting after the broker shut the channel down.
    pub recovery_delay: Duration,
    /// Upper bound for `wait_until_job_completed` before the job is revoked.
    pub job_completion_timeout: Duration,
    /// How often `wait_until_job_completed` looks at the job.
    pub job_poll_interval: Duration,
    /// Disposition of deliveries that cannot be parsed into a task.
    pub malformed_policy: MalformedMessagePolicy,
}

impl WorkerConfig {
    /// Creates a new `WorkerConfigBuilder` to start building the worker configuration.
    ///
    /// # Arguments
    /// * `queue_name` - The name of the queue to consume from.
    pub fn builder(queue_name: impl Into<String>) -> WorkerConfigBuilder {
        WorkerConfigBuilder::new(queue_name.into())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::builder(DEFAULT_QUEUE).build()
    }
}

/// A builder for creating `WorkerConfig` instances.
pub struct WorkerConfigBuilder {
    queue_name: String,
    exchange_name: Option<String>,
    consumer_tag: Option<String>,
    prefetch_count: Option<u16>,
    poll_timeout: Option<Duration>,
    connect_retry_delay: Option<Duration>,
    recovery_delay: Option<Duration>,
    job_completion_timeout: Option<Duration>,
    job_poll_interval: Option<Duration>,
    malformed_policy: Option<MalformedMessagePolicy>,
}

impl WorkerConfigBuilder {
    fn new(queue_name: String) -> Self {
        Self {
            queue_name,
            exchange_name: None,
            consumer_tag: None,
            prefetch_count: None,
            poll_timeout: None,
            connect_retry_delay: None,
            recovery_delay: None,
            job_completion_timeout: None,
            job_poll_interval: None,
            malformed_policy: None,
        }
    }

    /// Sets the response exchange.
    /// Defaults to `celeryresults` if not set.
    pub fn exchange_name(mut self, exchange_name: impl Into<String>) -> Self {
        self.exchange_name = Some(exchange_name.into());
        self
    }

    /// Sets a custom consumer tag.
    /// Defaults to `{queue_name}_consumer` if not set.
    pub fn consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    /// Sets a custom prefetch count (QoS).
    /// Defaults to 1. Tasks are still handled one at a time; a larger value only
    /// lets the broker push deliveries ahead of the handler.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn connect_retry_delay(mut self, delay: Duration) -> Self {
        self.connect_retry_delay = Some(delay);
        self
    }

    pub fn recovery_delay(mut self, delay: Duration) -> Self {
        self.recovery_delay = Some(delay);
        self
    }

    pub fn job_completion_timeout(mut self, timeout: Duration) -> Self {
        self.job_completion_timeout = Some(timeout);
        self
    }

    pub fn job_poll_interval(mut self, interval: Duration) -> Self {
        self.job_poll_interval = Some(interval);
        self
    }

    pub fn malformed_policy(mut self, policy: MalformedMessagePolicy) -> Self {
        self.malformed_policy = Some(policy);
        self
    }

    /// Builds the final `WorkerConfig`, applying defaults for any unset options.
    pub fn build(self) -> WorkerConfig {
        use crate::worker::Worker;

        let queue_name = self.queue_name;
        WorkerConfig {
            exchange_name: self
                .exchange_name
                .unwrap_or_else(|| DEFAULT_RESULT_EXCHANGE.to_string()),
            consumer_tag: self
                .consumer_tag
                .unwrap_or_else(|| format!("{}_consumer", queue_name)),
            prefetch_count: self.prefetch_count.unwrap_or(1),
            poll_timeout: self.poll_timeout.unwrap_or(Worker::POLLING_TIMEOUT),
            connect_retry_delay: self
                .connect_retry_delay
                .unwrap_or(Worker::CONNECT_RETRY_DELAY),
            recovery_delay: self.recovery_delay.unwrap_or(Worker::RECOVERY_DELAY),
            job_completion_timeout: self
                .job_completion_timeout
                .unwrap_or(Worker::JOB_COMPLETION_TIMEOUT),
            job_poll_interval: self
                .job_poll_interval
                .unwrap_or(Worker::JOB_POLL_INTERVAL),
            malformed_policy: self.malformed_policy.unwrap_or_default(),
            queue_name,
        }
    }
}
