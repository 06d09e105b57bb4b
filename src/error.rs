use thiserror::Error;

/// Generic error type for the task worker library.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// Error while encoding or decoding JSON.
    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An incoming message could not be turned into a task.
    #[error("Malformed task message: {reason}")]
    MalformedTask { reason: String },

    /// The broker closed the channel or connection underneath us.
    #[error("Broker channel closed: {reason}")]
    ChannelClosed { reason: String },

    /// An operation needed an open channel and there was none.
    #[error("Not connected to the broker")]
    NotConnected,

    /// A lifecycle operation was requested in a state that does not allow it.
    #[error("Illegal worker state: {0}")]
    IllegalState(String),

    /// Custom messaging-related error.
    #[error("Messaging setup or configuration error: {message}")]
    MessagingError { message: String },

    /// Error from the task handler logic.
    #[error("Task handler failed: {0}")]
    HandlerError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Coarse classification the consume loop uses to pick a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// I/O hiccup or an already-closed handle. Logged, the loop carries on.
    Transport,
    /// The broker shut the channel or connection down. Triggers recovery.
    Shutdown,
    /// The message payload is not a task.
    MalformedInput,
    /// The task handler failed.
    Handler,
    /// Anything else.
    Internal,
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Lapin(err) => match err {
                lapin::Error::IOError(_) | lapin::Error::InvalidChannelState(_) => {
                    ErrorKind::Transport
                }
                lapin::Error::InvalidConnectionState(_)
                | lapin::Error::InvalidChannel(_)
                | lapin::Error::ProtocolError(_)
                | lapin::Error::MissingHeartbeatError => ErrorKind::Shutdown,
                _ => ErrorKind::Internal,
            },
            WorkerError::ChannelClosed { .. } | WorkerError::NotConnected => ErrorKind::Shutdown,
            WorkerError::Serialization(_) | WorkerError::MalformedTask { .. } => {
                ErrorKind::MalformedInput
            }
            WorkerError::HandlerError(_) => ErrorKind::Handler,
            WorkerError::IllegalState(_) | WorkerError::MessagingError { .. } => {
                ErrorKind::Internal
            }
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        WorkerError::MalformedTask { reason: reason.into() }
    }

    pub(crate) fn channel_closed(reason: impl Into<String>) -> Self {
        WorkerError::ChannelClosed { reason: reason.into() }
    }
}

// Allow converting from a string-like type into a MessagingError
impl From<&str> for WorkerError {
    fn from(s: &str) -> Self {
        WorkerError::MessagingError { message: s.to_string() }
    }
}

impl From<String> for WorkerError {
    fn from(s: String) -> Self {
        WorkerError::MessagingError { message: s }
    }
}
