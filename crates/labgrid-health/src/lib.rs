//! labgrid-health — lease-based worker health monitoring.
//!
//! Every worker runs an agent that renews a heartbeat lease named after the
//! worker. The monitor periodically compares each lease's expiry with the
//! current time and flips the worker's `Ready` condition on the edges only:
//! a worker that stops renewing goes `NotReady`, one that resumes goes
//! `Ready`, and a steady state causes no writes.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor (fixed-period loop, watch shutdown)
//!   ├── list Workers
//!   ├── get Lease {lease_namespace}/{worker}
//!   └── update_status(Worker) on Ready transitions
//! ```

pub mod error;
pub mod monitor;

pub use error::{HealthError, HealthResult, WorkerFailure};
pub use monitor::{DEFAULT_MONITOR_PERIOD, HealthMonitor, Transition};
