//! Health monitor — background task that derives worker readiness from leases.
//!
//! The `HealthMonitor` wakes every `period`, evaluates every worker against
//! its heartbeat lease and writes the worker's `Ready` condition when it has
//! to change. Evaluation of one worker never stops evaluation of the others;
//! per-worker failures are reported together at the end of the round.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use labgrid_state::*;

use crate::error::{HealthError, HealthResult, WorkerFailure};

/// Default evaluation period.
pub const DEFAULT_MONITOR_PERIOD: Duration = Duration::from_secs(1);

/// A change of a worker's `Ready` condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Ready(String),
    NotReady(String),
}

/// Periodically reconciles worker `Ready` conditions with heartbeat leases.
#[derive(Clone)]
pub struct HealthMonitor {
    state: StateStore,
    lease_namespace: String,
    period: Duration,
}

impl HealthMonitor {
    /// Create a new health monitor.
    pub fn new(state: StateStore, lease_namespace: impl Into<String>, period: Duration) -> Self {
        Self {
            state,
            lease_namespace: lease_namespace.into(),
            period,
        }
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            period = ?self.period,
            namespace = %self.lease_namespace,
            "health monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Store access is synchronous; keep it off the async workers.
                    let monitor = self.clone();
                    match tokio::task::spawn_blocking(move || monitor.check_workers()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!(error = %e, "failed to monitor some workers"),
                        Err(e) => error!(error = %e, "health check task panicked"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("health monitor shutting down");
                    break;
                }
            }
        }
    }

    /// Evaluate every worker against the current time.
    pub fn check_workers(&self) -> HealthResult<Vec<Transition>> {
        self.check_workers_at(epoch_millis())
    }

    /// Evaluate every worker as of `now_ms` (unix milliseconds).
    pub fn check_workers_at(&self, now_ms: u64) -> HealthResult<Vec<Transition>> {
        let workers = self.state.list::<Worker>().map_err(HealthError::List)?;

        let mut transitions = Vec::new();
        let mut failures = Vec::new();
        for worker in workers {
            let name = worker.metadata.name.clone();
            match self.check_worker(worker, now_ms) {
                Ok(Some(transition)) => transitions.push(transition),
                Ok(None) => {}
                Err(error) => failures.push(WorkerFailure {
                    worker: name,
                    error,
                }),
            }
        }

        if failures.is_empty() {
            Ok(transitions)
        } else {
            Err(HealthError::Workers { failures })
        }
    }

    fn check_worker(&self, mut worker: Worker, now_ms: u64) -> StateResult<Option<Transition>> {
        let name = worker.metadata.name.clone();
        let lease = self
            .state
            .get_namespaced::<Lease>(&self.lease_namespace, &name)?;
        // A worker that never registered a lease is simply not live.
        let live = lease.is_some_and(|l| l.spec.is_live_at(now_ms));
        let ready = get_condition(&worker, WorkerCondition::Ready).is_true();

        let transition = if ready && !live {
            info!(event = "NotReady", worker = %name, "Worker went down");
            set_condition_at(
                &mut worker,
                WorkerCondition::Ready,
                ConditionStatus::False,
                "HealthCheckFail",
                "failed to check health",
                now_ms,
            );
            Transition::NotReady(name)
        } else if !ready && live {
            info!(event = "Ready", worker = %name, "Worker is ready");
            set_condition_at(
                &mut worker,
                WorkerCondition::Ready,
                ConditionStatus::True,
                "HealthCheck",
                "checked health",
                now_ms,
            );
            Transition::Ready(name)
        } else {
            return Ok(None);
        };

        self.state.update_status(&worker)?;
        Ok(Some(transition))
    }
}
