//! The metric families labgrid exports.

use crate::error::MetricsResult;
use crate::registry::{CounterVec, GaugeVec, Registry};

/// Outcome label values for `labgrid_acquisitions_total`.
pub const ACQUIRE_SUCCESS: &str = "success";
pub const ACQUIRE_UNAVAILABLE: &str = "unavailable";
pub const ACQUIRE_CONFLICT: &str = "conflict";
pub const ACQUIRE_ERROR: &str = "error";

/// Handles to every labgrid metric family.
#[derive(Clone)]
pub struct LabgridMetrics {
    pub problems_total: GaugeVec,
    /// `{name, status}` where status is total, scheduled, assignable or assigned.
    pub problem_replicas: GaugeVec,
    pub problem_desired_assignable_replicas: GaugeVec,
    pub workers_total: GaugeVec,
    pub worker_ready: GaugeVec,
    pub worker_schedulable: GaugeVec,
    pub worker_scheduled_environments: GaugeVec,
    /// `{problem, result}`; see the `ACQUIRE_*` constants.
    pub acquisitions_total: CounterVec,
}

impl LabgridMetrics {
    /// Register every family on `registry`.
    pub fn register(registry: &Registry) -> MetricsResult<Self> {
        Ok(Self {
            problems_total: registry.gauge_vec(
                "labgrid_problems_total",
                "Number of problems.",
                &[],
            )?,
            problem_replicas: registry.gauge_vec(
                "labgrid_problem_replicas",
                "Problem environments per problem by lifecycle stage.",
                &["name", "status"],
            )?,
            problem_desired_assignable_replicas: registry.gauge_vec(
                "labgrid_problem_desired_assignable_replicas",
                "Declared number of assignable replicas per problem.",
                &["name"],
            )?,
            workers_total: registry.gauge_vec(
                "labgrid_workers_total",
                "Number of workers.",
                &[],
            )?,
            worker_ready: registry.gauge_vec(
                "labgrid_worker_ready",
                "Whether the worker's heartbeat lease is current (1) or not (0).",
                &["name"],
            )?,
            worker_schedulable: registry.gauge_vec(
                "labgrid_worker_schedulable",
                "Whether scheduling is enabled on the worker.",
                &["name"],
            )?,
            worker_scheduled_environments: registry.gauge_vec(
                "labgrid_worker_scheduled_environments",
                "Problem environments placed on the worker.",
                &["name"],
            )?,
            acquisitions_total: registry.counter_vec(
                "labgrid_acquisitions_total",
                "Environment acquisition requests by outcome.",
                &["problem", "result"],
            )?,
        })
    }
}
