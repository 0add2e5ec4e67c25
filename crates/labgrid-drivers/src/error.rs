//! Driver error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{kind} `{name}` is already registered")]
    AlreadyRegistered { kind: &'static str, name: String },

    #[error("no {kind} named `{name}`")]
    Unknown { kind: &'static str, name: String },

    /// A node label carries a value the access method cannot use.
    #[error("invalid value {value:?} for label {label}")]
    InvalidLabel { label: String, value: String },

    #[error("{0}")]
    Failed(String),
}

pub type DriverResult<T> = Result<T, DriverError>;
