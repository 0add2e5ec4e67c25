//! labgrid-drivers — ports to the collaborators that touch worker machines.
//!
//! Provisioning and terminal access run on the workers, outside the control
//! plane. This crate fixes their interfaces and the registries that select an
//! implementation by name:
//!
//! | Port | Built-in implementations |
//! |---|---|
//! | [`EnvironmentDriver`] (check / deploy / destroy) | `noop` |
//! | [`AccessMethod`] (command line to reach a node) | `exec`, `ssh` |

pub mod access;
pub mod environment;
pub mod error;
pub mod registry;

pub use access::{AccessCommand, AccessMethod, AccessTarget, ExecAccess, SshAccess};
pub use environment::{EnvironmentDriver, NoopDriver};
pub use error::{DriverError, DriverResult};
pub use registry::{AccessRegistry, DriverRegistry, Registry};
