//! Health monitor error types.

use labgrid_state::StateError;
use thiserror::Error;

/// A single worker that could not be evaluated.
#[derive(Debug)]
pub struct WorkerFailure {
    pub worker: String,
    pub error: StateError,
}

/// Errors from one health evaluation round.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("failed to list workers: {0}")]
    List(#[source] StateError),

    /// Some workers failed; the others were still evaluated.
    #[error("failed to evaluate {} worker(s): {}", .failures.len(), describe(.failures))]
    Workers { failures: Vec<WorkerFailure> },
}

fn describe(failures: &[WorkerFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.worker, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type HealthResult<T> = Result<T, HealthError>;
