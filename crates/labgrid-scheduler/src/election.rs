//! Worker election for environment placement.
//!
//! A worker is eligible when scheduling is enabled on it, its `Ready`
//! condition is true and its labels satisfy every selector. The eligible
//! worker with the lowest combined CPU and memory usage is elected; ties go
//! to the first worker in listing order.

use labgrid_state::{Worker, WorkerCondition, WorkerSelector, get_condition};

/// Usage assumed for a metric the worker has not reported.
pub const MAX_USED_PERCENT: f64 = 100.0;

/// Whether `worker` may host an environment with these selectors.
pub fn is_schedulable(worker: &Worker, selectors: &[WorkerSelector]) -> bool {
    if worker.spec.disable_schedule {
        return false;
    }
    if !get_condition(worker, WorkerCondition::Ready).is_true() {
        return false;
    }
    selectors
        .iter()
        .all(|selector| selector.matches(&worker.metadata.labels))
}

/// Combined CPU and memory usage in percent (0..=200). Lower is better.
pub fn load_score(worker: &Worker) -> f64 {
    let info = &worker.status.worker_info;
    info.cpu_used_percent.unwrap_or(MAX_USED_PERCENT)
        + info.memory_used_percent.unwrap_or(MAX_USED_PERCENT)
}

/// Pick the least loaded eligible worker.
pub fn elect_worker<'a>(workers: &'a [Worker], selectors: &[WorkerSelector]) -> Option<&'a Worker> {
    let mut elected: Option<(&Worker, f64)> = None;
    for worker in workers.iter().filter(|w| is_schedulable(w, selectors)) {
        let score = load_score(worker);
        match elected {
            Some((_, best)) if score >= best => {}
            _ => elected = Some((worker, score)),
        }
    }
    elected.map(|(worker, _)| worker)
}
