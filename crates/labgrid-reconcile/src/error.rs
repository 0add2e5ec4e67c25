//! Controller runtime error types.

use thiserror::Error;

/// Errors that stop a controller.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state store error: {0}")]
    State(#[from] labgrid_state::StateError),

    #[error("store watch channel closed")]
    WatchClosed,
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
