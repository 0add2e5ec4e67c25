//! Scheduler error types.

use thiserror::Error;

/// Errors that fail a scheduling pass and trigger a backoff retry.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state store error: {0}")]
    State(#[from] labgrid_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
