//! EnvironmentScheduler — places and confirms problem environments.
//!
//! An environment without `worker_name` is scheduled: a worker is elected
//! and written to the spec. The spec write wakes the environment again and
//! the second pass confirms the placement, initialises the lifecycle
//! conditions and tracks container readiness from then on.

use std::time::Duration;

use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::{debug, error, info};

use labgrid_reconcile::{Action, Reconciler};
use labgrid_state::*;

use crate::election::elect_worker;
use crate::error::SchedulerResult;

/// Length of the generated environment password.
pub const PASSWORD_LENGTH: usize = 24;

/// Retry delay while no worker can take the environment.
pub const SCHEDULE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Retry delay while the assigned worker is missing.
pub const CONFIRM_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Random alphanumeric password of `length` characters.
pub fn generate_password(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Reconciles problem environments onto workers.
pub struct EnvironmentScheduler {
    store: StateStore,
}

impl EnvironmentScheduler {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    fn reconcile_environment(&self, name: &str) -> SchedulerResult<Action> {
        let Some(pe) = self.store.get::<ProblemEnvironment>(name)? else {
            debug!(environment = %name, "environment gone, nothing to do");
            return Ok(Action::AwaitChange);
        };

        if pe.metadata.is_deleting() {
            debug!(environment = %name, "being deleted, ignoring");
            return Ok(Action::AwaitChange);
        }

        if pe.spec.worker_name.is_empty() {
            self.schedule(pe)
        } else {
            self.confirm(pe)
        }
    }

    fn schedule(&self, mut pe: ProblemEnvironment) -> SchedulerResult<Action> {
        let name = pe.metadata.name.clone();

        let workers = match self.store.list::<Worker>() {
            Ok(workers) => workers,
            Err(e) => {
                let message = "failed to list Workers";
                error!(environment = %name, error = %e, "{message}");
                set_condition(
                    &mut pe,
                    EnvironmentCondition::Scheduled,
                    ConditionStatus::False,
                    "WorkersMissing",
                    message,
                );
                self.persist_status(&pe)?;
                return Ok(Action::RequeueAfter(SCHEDULE_RETRY_DELAY));
            }
        };

        let Some(elected) = elect_worker(&workers, &pe.spec.worker_selectors) else {
            let message = "there are no schedulable Workers";
            info!(environment = %name, workers = workers.len(), "{message}");
            if set_condition(
                &mut pe,
                EnvironmentCondition::Scheduled,
                ConditionStatus::False,
                "WorkersNotSchedulable",
                message,
            ) {
                self.persist_status(&pe)?;
            }
            return Ok(Action::RequeueAfter(SCHEDULE_RETRY_DELAY));
        };

        let worker = elected.metadata.name.clone();
        pe.spec.worker_name = worker.clone();
        self.store.update(&pe).inspect_err(|e| {
            error!(environment = %name, %worker, error = %e, "failed to update");
        })?;
        info!(environment = %name, %worker, "elected worker");
        Ok(Action::AwaitChange)
    }

    fn confirm(&self, mut pe: ProblemEnvironment) -> SchedulerResult<Action> {
        let name = pe.metadata.name.clone();
        let worker = pe.spec.worker_name.clone();

        if self.store.get::<Worker>(&worker)?.is_none() {
            let message = "failed to get Worker";
            error!(environment = %name, %worker, "{message}");
            if set_condition(
                &mut pe,
                EnvironmentCondition::Scheduled,
                ConditionStatus::False,
                "WorkersMissing",
                message,
            ) {
                self.persist_status(&pe)?;
            }
            return Ok(Action::RequeueAfter(CONFIRM_RETRY_DELAY));
        }

        let newly_confirmed = !get_condition(&pe, EnvironmentCondition::Scheduled).is_true();
        let mut changed = set_condition(
            &mut pe,
            EnvironmentCondition::Scheduled,
            ConditionStatus::True,
            "Scheduled",
            "ProblemEnvironment is assigned to Worker",
        );
        if find_condition(&pe, EnvironmentCondition::Deployed).is_none() {
            changed |= set_condition(
                &mut pe,
                EnvironmentCondition::Deployed,
                ConditionStatus::False,
                "NotDeployed",
                "ProblemEnvironment is not deployed to Worker",
            );
        }
        if find_condition(&pe, EnvironmentCondition::Assigned).is_none() {
            changed |= set_condition(
                &mut pe,
                EnvironmentCondition::Assigned,
                ConditionStatus::False,
                "NotAssigned",
                "ProblemEnvironment is not assigned",
            );
        }
        if pe.status.password.is_empty() {
            pe.status.password = generate_password(PASSWORD_LENGTH);
            changed = true;
        }

        changed |= if pe.containers_ready() {
            set_condition(
                &mut pe,
                EnvironmentCondition::Ready,
                ConditionStatus::True,
                "Ready",
                "ProblemEnvironment is ready",
            )
        } else {
            set_condition(
                &mut pe,
                EnvironmentCondition::Ready,
                ConditionStatus::False,
                "NotReady",
                "ProblemEnvironment is not ready",
            )
        };

        if changed {
            self.persist_status(&pe)?;
        }
        if newly_confirmed {
            info!(environment = %name, %worker, "confirmed");
        }
        Ok(Action::AwaitChange)
    }

    fn persist_status(&self, pe: &ProblemEnvironment) -> SchedulerResult<()> {
        self.store.update_status(pe).inspect_err(|e| {
            error!(environment = %pe.metadata.name, error = %e, "failed to update status");
        })?;
        Ok(())
    }
}

impl Reconciler for EnvironmentScheduler {
    type Error = crate::error::SchedulerError;

    const NAME: &'static str = "scheduler";
    const KIND: ResourceKind = ResourceKind::ProblemEnvironment;

    fn reconcile(&self, key: &str) -> SchedulerResult<Action> {
        self.reconcile_environment(key)
    }
}
