//! Replica controller error types.

use thiserror::Error;

/// Errors that fail a replica reconcile and trigger a backoff retry.
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("state store error: {0}")]
    State(#[from] labgrid_state::StateError),
}

pub type ReplicaResult<T> = Result<T, ReplicaError>;
