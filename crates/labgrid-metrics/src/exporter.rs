//! Metrics exporter — refreshes fleet gauges from the object store.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use labgrid_state::*;

use crate::error::MetricsResult;
use crate::families::LabgridMetrics;

/// Periodically mirrors problems and workers into gauges.
#[derive(Clone)]
pub struct MetricsExporter {
    state: StateStore,
    metrics: LabgridMetrics,
    interval: Duration,
}

impl MetricsExporter {
    pub fn new(state: StateStore, metrics: LabgridMetrics, interval: Duration) -> Self {
        Self {
            state,
            metrics,
            interval,
        }
    }

    /// Run the refresh loop until `shutdown` fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "metrics exporter started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let exporter = self.clone();
                    match tokio::task::spawn_blocking(move || exporter.refresh()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(error = %e, "failed to export metrics"),
                        Err(e) => error!(error = %e, "metrics refresh task panicked"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("metrics exporter shutting down");
                    break;
                }
            }
        }
    }

    /// Re-export every gauge from a fresh listing.
    ///
    /// Each family is replaced as a whole, so deleted objects disappear from
    /// the output and a concurrent scrape never sees a half-built family.
    pub fn refresh(&self) -> MetricsResult<()> {
        let problems = self.state.list::<Problem>()?;
        let workers = self.state.list::<Worker>()?;
        let environments = self.state.list::<ProblemEnvironment>()?;
        let m = &self.metrics;

        let mut placed: HashMap<&str, usize> = HashMap::new();
        for pe in &environments {
            if !pe.spec.worker_name.is_empty() {
                *placed.entry(pe.spec.worker_name.as_str()).or_default() += 1;
            }
        }

        let mut ready = Vec::with_capacity(workers.len());
        let mut schedulable = Vec::with_capacity(workers.len());
        let mut scheduled = Vec::with_capacity(workers.len());
        for worker in &workers {
            let name = worker.metadata.name.as_str();
            let is_ready = get_condition(worker, WorkerCondition::Ready).is_true();
            ready.push((vec![name], flag(is_ready)));
            schedulable.push((vec![name], flag(!worker.spec.disable_schedule)));
            let count = placed.get(name).copied().unwrap_or(0);
            scheduled.push((vec![name], count as f64));
        }
        m.workers_total.set(&[], workers.len() as f64);
        m.worker_ready.replace(ready);
        m.worker_schedulable.replace(schedulable);
        m.worker_scheduled_environments.replace(scheduled);

        let mut replica_samples = Vec::with_capacity(problems.len() * 4);
        let mut desired = Vec::with_capacity(problems.len());
        for problem in &problems {
            let name = problem.metadata.name.as_str();
            let replicas = problem.status.replicas;
            for (status, value) in [
                ("total", replicas.total),
                ("scheduled", replicas.scheduled),
                ("assignable", replicas.assignable),
                ("assigned", replicas.assigned),
            ] {
                replica_samples.push((vec![name, status], f64::from(value)));
            }
            desired.push((vec![name], f64::from(problem.spec.assignable_replicas)));
        }
        m.problems_total.set(&[], problems.len() as f64);
        m.problem_replicas.replace(replica_samples);
        m.problem_desired_assignable_replicas.replace(desired);

        debug!(
            problems = problems.len(),
            workers = workers.len(),
            environments = environments.len(),
            "metrics refreshed"
        );
        Ok(())
    }
}

fn flag(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prometheus::render_prometheus;
    use crate::registry::Registry;

    fn setup() -> (StateStore, Registry, MetricsExporter) {
        let state = StateStore::open_in_memory().unwrap();
        let registry = Registry::new();
        let metrics = LabgridMetrics::register(&registry).unwrap();
        let exporter = MetricsExporter::new(state.clone(), metrics, Duration::from_millis(20));
        (state, registry, exporter)
    }

    fn add_worker(state: &StateStore, name: &str, ready: bool, disabled: bool) {
        let mut w = state
            .create(Worker::new(
                ObjectMeta::named(name),
                WorkerSpec {
                    disable_schedule: disabled,
                },
            ))
            .unwrap();
        set_condition(&mut w, WorkerCondition::Ready, ready.into(), "HealthCheck", "");
        state.update_status(&w).unwrap();
    }

    fn place(state: &StateStore, name: &str, worker: &str) {
        let mut pe = ProblemEnvironment::new(ObjectMeta::named(name), EnvironmentSpec::default());
        pe.spec.worker_name = worker.to_string();
        state.create(pe).unwrap();
    }

    #[test]
    fn exports_worker_gauges() {
        let (state, _registry, exporter) = setup();
        add_worker(&state, "w1", true, false);
        add_worker(&state, "w2", false, true);
        place(&state, "pe1", "w1");
        place(&state, "pe2", "w1");
        place(&state, "pe3", "");

        exporter.refresh().unwrap();
        let m = &exporter.metrics;
        assert_eq!(m.workers_total.get(&[]), Some(2.0));
        assert_eq!(m.worker_ready.get(&["w1"]), Some(1.0));
        assert_eq!(m.worker_ready.get(&["w2"]), Some(0.0));
        assert_eq!(m.worker_schedulable.get(&["w2"]), Some(0.0));
        assert_eq!(m.worker_scheduled_environments.get(&["w1"]), Some(2.0));
        assert_eq!(m.worker_scheduled_environments.get(&["w2"]), Some(0.0));
    }

    #[test]
    fn exports_problem_gauges() {
        let (state, registry, exporter) = setup();
        let mut problem = state
            .create(Problem::new(
                ObjectMeta::named("p1"),
                ProblemSpec {
                    assignable_replicas: 3,
                    ..Default::default()
                },
            ))
            .unwrap();
        problem.status.replicas = ReplicaCounts {
            total: 4,
            scheduled: 4,
            assignable: 2,
            assigned: 1,
        };
        state.update_status(&problem).unwrap();

        exporter.refresh().unwrap();
        let output = render_prometheus(&registry);
        assert!(output.contains("labgrid_problems_total 1\n"));
        assert!(output.contains("labgrid_problem_replicas{name=\"p1\",status=\"assignable\"} 2\n"));
        assert!(output.contains("labgrid_problem_replicas{name=\"p1\",status=\"assigned\"} 1\n"));
        assert!(output.contains("labgrid_problem_desired_assignable_replicas{name=\"p1\"} 3\n"));
    }

    #[test]
    fn deleted_objects_drop_out() {
        let (state, _registry, exporter) = setup();
        add_worker(&state, "w1", true, false);
        exporter.refresh().unwrap();
        assert!(exporter.metrics.worker_ready.get(&["w1"]).is_some());

        state.delete::<Worker>("w1").unwrap();
        exporter.refresh().unwrap();
        assert!(exporter.metrics.worker_ready.get(&["w1"]).is_none());
        assert_eq!(exporter.metrics.workers_total.get(&[]), Some(0.0));
    }

    #[test]
    fn scrapes_during_refresh_see_complete_families() {
        let (state, registry, exporter) = setup();
        add_worker(&state, "w1", true, false);
        exporter.refresh().unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..200 {
                    exporter.refresh().unwrap();
                }
            });
            for _ in 0..200 {
                let output = render_prometheus(&registry);
                assert!(output.contains("labgrid_worker_ready{name=\"w1\"} 1\n"));
                assert!(output.contains("labgrid_worker_schedulable{name=\"w1\"} 1\n"));
            }
        });
    }

    #[tokio::test]
    async fn exporter_loop_refreshes_until_shutdown() {
        let (state, _registry, exporter) = setup();
        let metrics = exporter.metrics.clone();
        add_worker(&state, "w1", true, false);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(exporter.run(rx));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while metrics.workers_total.get(&[]) != Some(1.0) {
            assert!(std::time::Instant::now() < deadline, "exporter never refreshed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
