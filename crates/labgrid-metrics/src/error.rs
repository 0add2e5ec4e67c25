//! Metrics error types.

use thiserror::Error;

/// Errors raised while registering or refreshing metrics.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric family already registered: {0}")]
    AlreadyRegistered(String),

    #[error("invalid metric name: {0}")]
    InvalidName(String),

    #[error("state store error: {0}")]
    State(#[from] labgrid_state::StateError),
}

pub type MetricsResult<T> = Result<T, MetricsError>;
