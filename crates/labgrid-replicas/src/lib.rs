//! labgrid-replicas — replica controller for problems.
//!
//! Keeps `spec.assignable_replicas` unassigned environments alive for every
//! problem by creating one environment per pass from the problem's template,
//! or deleting surplus unassigned ones. Assigned environments are never
//! touched; they leave when their client releases them, at which point a
//! replacement is created.

pub mod controller;
pub mod error;

pub use controller::{ReplicaController, environment_from_template, replica_counts};
pub use error::{ReplicaError, ReplicaResult};
