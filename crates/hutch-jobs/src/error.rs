//! Job error types.

use std::convert::Infallible;
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
///
/// Cloneable so the same error can be returned to a caller and broadcast
/// as a [`crate::WorkQueueEvent::Error`].
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// A job builder argument or queue setting was rejected.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Publish attempted while the broker connection is down.
    #[error("{transport} client is not currently connected")]
    NotConnected { transport: String },

    /// A delivered message names a worker with no registered handler.
    #[error("No handler registered for worker '{0}'")]
    UnknownWorker(String),

    /// A handler reported failure. Drives the retry state machine.
    #[error("Handler failed: {0}")]
    HandlerFailure(String),

    /// The broker is unreachable, refused the credentials or closed the channel.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// A delivered message does not carry a valid job envelope.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid work queue state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Creates a handler failure from any displayable error.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        JobError::HandlerFailure(err.to_string())
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::HandlerFailure(_) | JobError::UnknownWorker(_))
    }

    /// Returns true if the message should go straight to the failed queue.
    pub fn should_dead_letter(&self) -> bool {
        matches!(
            self,
            JobError::MalformedEnvelope(_) | JobError::Serialization(_)
        )
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Serialization(err.to_string())
    }
}

impl From<Infallible> for JobError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

impl From<hutch_config::ConfigError> for JobError {
    fn from(err: hutch_config::ConfigError) -> Self {
        JobError::InvalidConfiguration(err.to_string())
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for JobError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                JobError::NotConnected {
                    transport: "amqp".to_string(),
                }
            }
            other => JobError::Transport(other.to_string()),
        }
    }
}
