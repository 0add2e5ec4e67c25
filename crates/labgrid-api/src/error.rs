//! Error types for the assignment broker.

use labgrid_state::StateError;

/// Errors returned by [`Broker`](crate::Broker) operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("problem environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("problem not found: {0}")]
    ProblemNotFound(String),

    /// The environment points at a worker that does not exist.
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("no available problem environment for: {0}")]
    NoAvailableEnvironment(String),

    /// The chosen environment changed between read and write; retryable.
    #[error("problem environment {0} was modified concurrently")]
    Conflict(String),

    #[error(transparent)]
    State(#[from] StateError),
}

pub type BrokerResult<T> = Result<T, BrokerError>;
