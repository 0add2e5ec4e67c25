//! labgrid-scheduler — two-phase placement of environments onto workers.
//!
//! Phase one picks a worker for an environment that has none: the worker
//! must accept scheduling, report `Ready`, and satisfy every selector of the
//! environment. Among those, the least loaded (CPU plus memory percentage)
//! wins. Phase two confirms the chosen worker still exists, initialises the
//! environment's lifecycle conditions and credentials, and keeps its `Ready`
//! condition in line with the container status reported by the driver.
//!
//! # Architecture
//!
//! ```text
//! EnvironmentScheduler (Reconciler over ProblemEnvironment)
//!   ├── worker_name == ""  → election::elect_worker → update(spec.worker_name)
//!   └── worker_name != ""  → confirm → update_status(conditions, password)
//! ```

pub mod election;
pub mod error;
pub mod scheduler;

pub use election::{MAX_USED_PERCENT, elect_worker, is_schedulable, load_score};
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{EnvironmentScheduler, PASSWORD_LENGTH, generate_password};
