//! Environment drivers: bring an environment's topology up and down on the
//! worker it was scheduled to.

use labgrid_state::ProblemEnvironment;

use crate::error::DriverResult;

/// Provisions the topology of a [`ProblemEnvironment`] on its worker.
///
/// Implementations live with the per-worker agent; calls are synchronous and
/// may block for as long as the provisioning tool takes.
pub trait EnvironmentDriver: Send + Sync {
    /// Whether the environment is currently deployed.
    fn check(&self, pe: &ProblemEnvironment) -> DriverResult<bool>;

    fn deploy(&self, pe: &ProblemEnvironment) -> DriverResult<()>;

    fn destroy(&self, pe: &ProblemEnvironment) -> DriverResult<()>;
}

/// Driver that provisions nothing and reports every environment as deployed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDriver;

impl NoopDriver {
    pub const NAME: &'static str = "noop";
}

impl EnvironmentDriver for NoopDriver {
    fn check(&self, _pe: &ProblemEnvironment) -> DriverResult<bool> {
        Ok(true)
    }

    fn deploy(&self, _pe: &ProblemEnvironment) -> DriverResult<()> {
        Ok(())
    }

    fn destroy(&self, _pe: &ProblemEnvironment) -> DriverResult<()> {
        Ok(())
    }
}
