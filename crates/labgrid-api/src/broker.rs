//! Assignment broker — hands out exclusive claims on ready environments.
//!
//! The broker holds no locks. Exclusivity comes from the store's conditional
//! status write: of two requests that read the same environment, only the
//! first write succeeds and the other reports [`BrokerError::Conflict`].

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use labgrid_metrics::LabgridMetrics;
use labgrid_metrics::families::{
    ACQUIRE_CONFLICT, ACQUIRE_ERROR, ACQUIRE_SUCCESS, ACQUIRE_UNAVAILABLE,
};
use labgrid_state::*;

use crate::error::{BrokerError, BrokerResult};

/// Connection details for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl Descriptor {
    fn new(pe: &ProblemEnvironment, worker: &Worker) -> Self {
        let info = &worker.status.worker_info;
        Self {
            name: pe.metadata.name.clone(),
            host: info.external_ip_address.clone(),
            port: info.external_port,
            user: pe.username(),
            password: pe.status.password.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Broker {
    store: StateStore,
    metrics: LabgridMetrics,
}

impl Broker {
    pub fn new(store: StateStore, metrics: LabgridMetrics) -> Self {
        Self { store, metrics }
    }

    /// Connection details of an existing environment.
    pub fn describe(&self, name: &str) -> BrokerResult<Descriptor> {
        let pe = self
            .store
            .get::<ProblemEnvironment>(name)?
            .ok_or_else(|| BrokerError::EnvironmentNotFound(name.to_string()))?;
        self.descriptor_for(&pe)
    }

    /// Claim one ready, unassigned environment of `problem_name`.
    ///
    /// The oldest candidate wins; ties are broken by name.
    pub fn acquire(&self, problem_name: &str) -> BrokerResult<Descriptor> {
        if self.store.get::<Problem>(problem_name)?.is_none() {
            // Not counted: the label would take arbitrary client input.
            return Err(BrokerError::ProblemNotFound(problem_name.to_string()));
        }

        let result = self.assign(problem_name);
        let outcome = match &result {
            Ok(_) => ACQUIRE_SUCCESS,
            Err(BrokerError::NoAvailableEnvironment(_)) => ACQUIRE_UNAVAILABLE,
            Err(BrokerError::Conflict(_)) => ACQUIRE_CONFLICT,
            Err(_) => ACQUIRE_ERROR,
        };
        self.metrics
            .acquisitions_total
            .inc(&[problem_name, outcome]);

        self.descriptor_for(&result?)
    }

    /// Delete an environment; the replica controller creates its replacement.
    pub fn release(&self, name: &str) -> BrokerResult<()> {
        if !self.store.delete::<ProblemEnvironment>(name)? {
            return Err(BrokerError::EnvironmentNotFound(name.to_string()));
        }
        info!(event = "Released", environment = %name, "ProblemEnvironment released");
        Ok(())
    }

    fn assign(&self, problem_name: &str) -> BrokerResult<ProblemEnvironment> {
        let mut candidates: Vec<ProblemEnvironment> = self
            .store
            .list_labeled(LABEL_PROBLEM_NAME, problem_name)?
            .into_iter()
            .filter(is_available)
            .collect();
        candidates.sort_by(|a, b| {
            (a.metadata.creation_timestamp, &a.metadata.name)
                .cmp(&(b.metadata.creation_timestamp, &b.metadata.name))
        });

        let Some(mut pe) = candidates.into_iter().next() else {
            return Err(BrokerError::NoAvailableEnvironment(problem_name.to_string()));
        };
        debug!(environment = %pe.metadata.name, problem = %problem_name, "candidate selected");

        set_condition(
            &mut pe,
            EnvironmentCondition::Assigned,
            ConditionStatus::True,
            "Assigned",
            "Assigned ProblemEnvironment",
        );
        let pe = self.store.update_status(&pe).map_err(|e| {
            // Changed or released under us: another request got there first.
            if e.is_conflict() || e.is_not_found() {
                BrokerError::Conflict(pe.metadata.name.clone())
            } else {
                BrokerError::State(e)
            }
        })?;

        info!(
            event = "Assigned",
            environment = %pe.metadata.name,
            problem = %problem_name,
            "ProblemEnvironment assigned"
        );
        Ok(pe)
    }

    fn descriptor_for(&self, pe: &ProblemEnvironment) -> BrokerResult<Descriptor> {
        let worker_name = &pe.spec.worker_name;
        let worker = self
            .store
            .get::<Worker>(worker_name)?
            .ok_or_else(|| BrokerError::WorkerNotFound(worker_name.clone()))?;
        Ok(Descriptor::new(pe, &worker))
    }
}

fn is_available(pe: &ProblemEnvironment) -> bool {
    !pe.metadata.is_deleting()
        && get_condition(pe, EnvironmentCondition::Assigned) == ConditionStatus::False
        && get_condition(pe, EnvironmentCondition::Ready).is_true()
}
