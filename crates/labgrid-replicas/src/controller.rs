//! Replica reconciler.
//!
//! One pass moves the number of assignable environments at most one step
//! towards `spec.assignable_replicas` when too few exist, or deletes the
//! whole surplus when too many exist, then refreshes `status.replicas`.
//! Every environment change wakes the owning problem again, so creation
//! converges one environment per pass.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use labgrid_reconcile::{Action, Reconciler};
use labgrid_state::*;

use crate::error::ReplicaResult;

/// Delay before retrying a failed status write.
pub const STATUS_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Reconciles problems into their environment replicas.
pub struct ReplicaController {
    store: StateStore,
}

impl ReplicaController {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    fn reconcile_problem(&self, name: &str) -> ReplicaResult<Action> {
        let Some(problem) = self.store.get::<Problem>(name).inspect_err(|e| {
            error!(problem = %name, error = %e, "could not get Problem");
        })?
        else {
            debug!(problem = %name, "problem gone, nothing to do");
            return Ok(Action::AwaitChange);
        };

        let mut children = self.list_children(&problem)?;

        if problem.metadata.is_deleting() {
            debug!(problem = %name, "problem being deleted, skipping replica management");
        } else if self.scale(&problem, &children)? {
            children = self.list_children(&problem)?;
        }

        let counts = replica_counts(&children);
        if counts == problem.status.replicas {
            return Ok(Action::AwaitChange);
        }

        let mut updated = problem;
        updated.status.replicas = counts;
        if let Err(e) = self.store.update_status(&updated) {
            warn!(problem = %name, error = %e, "failed to update Problem status");
            return Ok(Action::RequeueAfter(STATUS_RETRY_DELAY));
        }
        debug!(
            problem = %name,
            total = counts.total,
            scheduled = counts.scheduled,
            assignable = counts.assignable,
            assigned = counts.assigned,
            "problem status updated"
        );
        Ok(Action::AwaitChange)
    }

    fn list_children(&self, problem: &Problem) -> ReplicaResult<Vec<ProblemEnvironment>> {
        let children = self
            .store
            .list_owned_by::<ProblemEnvironment>(&problem.metadata)
            .inspect_err(|e| {
                error!(
                    problem = %problem.metadata.name,
                    error = %e,
                    "could not list ProblemEnvironments"
                );
            })?;
        Ok(children)
    }

    /// Create or delete environments. Returns whether anything changed.
    fn scale(&self, problem: &Problem, children: &[ProblemEnvironment]) -> ReplicaResult<bool> {
        let name = &problem.metadata.name;
        let desired = problem.spec.assignable_replicas as usize;
        let assignable: Vec<&ProblemEnvironment> =
            children.iter().filter(|pe| is_assignable(pe)).collect();

        if desired > assignable.len() {
            let created = self
                .store
                .create(environment_from_template(problem))
                .inspect_err(|e| {
                    error!(problem = %name, error = %e, "could not create new ProblemEnvironment");
                })?;
            info!(
                problem = %name,
                environment = %created.metadata.name,
                desired,
                assignable = assignable.len(),
                "created ProblemEnvironment"
            );
            return Ok(true);
        }

        if desired < assignable.len() {
            let surplus = assignable.len() - desired;
            for pe in assignable.into_iter().take(surplus) {
                let environment = &pe.metadata.name;
                // Conditional on the listed version: an environment claimed
                // since the listing must survive.
                match self.store.delete_unchanged(pe) {
                    Ok(_) => {
                        info!(problem = %name, %environment, "deleted ProblemEnvironment");
                    }
                    Err(e) if e.is_conflict() => {
                        debug!(problem = %name, %environment, "environment changed, not deleting");
                    }
                    Err(e) => {
                        error!(
                            problem = %name,
                            %environment,
                            error = %e,
                            "could not delete ProblemEnvironment"
                        );
                        return Err(e.into());
                    }
                }
            }
            return Ok(true);
        }

        Ok(false)
    }
}

impl Reconciler for ReplicaController {
    type Error = crate::error::ReplicaError;

    const NAME: &'static str = "replicas";
    const KIND: ResourceKind = ResourceKind::Problem;
    const OWNS: &'static [ResourceKind] = &[ResourceKind::ProblemEnvironment];

    fn reconcile(&self, key: &str) -> ReplicaResult<Action> {
        self.reconcile_problem(key)
    }
}

/// Not being deleted and not handed out to a client.
fn is_assignable(pe: &ProblemEnvironment) -> bool {
    !pe.metadata.is_deleting()
        && !get_condition(pe, EnvironmentCondition::Assigned).is_true()
}

/// Build a new environment for `problem` from its template.
pub fn environment_from_template(problem: &Problem) -> ProblemEnvironment {
    let template = &problem.spec.template;
    let mut metadata = ObjectMeta {
        generate_name: format!("{}-", problem.metadata.name),
        labels: template.metadata.labels.clone(),
        annotations: template.metadata.annotations.clone(),
        ..Default::default()
    };
    metadata
        .labels
        .insert(LABEL_PROBLEM_NAME.to_string(), problem.metadata.name.clone());
    metadata
        .owner_references
        .push(problem.metadata.owner_reference(ResourceKind::Problem));
    ProblemEnvironment::new(metadata, template.spec.clone())
}

/// Count environments by lifecycle stage.
pub fn replica_counts(children: &[ProblemEnvironment]) -> ReplicaCounts {
    let mut counts = ReplicaCounts {
        total: children.len() as u32,
        ..Default::default()
    };
    for pe in children {
        if get_condition(pe, EnvironmentCondition::Scheduled).is_true() {
            counts.scheduled += 1;
        }
        if get_condition(pe, EnvironmentCondition::Ready).is_true() {
            if get_condition(pe, EnvironmentCondition::Assigned).is_true() {
                counts.assigned += 1;
            } else {
                counts.assignable += 1;
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use labgrid_reconcile::Controller;

    use super::*;

    fn test_problem(name: &str, replicas: u32) -> Problem {
        Problem::new(
            ObjectMeta::named(name),
            ProblemSpec {
                template: EnvironmentTemplate {
                    metadata: TemplateMeta {
                        labels: BTreeMap::from([("track".to_string(), "routing".to_string())]),
                        annotations: BTreeMap::from([("score".to_string(), "100".to_string())]),
                    },
                    spec: EnvironmentSpec {
                        topology_ref: FileRef {
                            name: format!("{name}-topology"),
                            key: "manifest.clab.yml".to_string(),
                        },
                        ..Default::default()
                    },
                },
                assignable_replicas: replicas,
            },
        )
    }

    fn set_replicas(store: &StateStore, name: &str, replicas: u32) {
        let mut problem: Problem = store.get(name).unwrap().unwrap();
        problem.spec.assignable_replicas = replicas;
        store.update(&problem).unwrap();
    }

    fn children(store: &StateStore, name: &str) -> Vec<ProblemEnvironment> {
        store.list_labeled(LABEL_PROBLEM_NAME, name).unwrap()
    }

    /// Run passes until the number of environments stops changing.
    fn converge(controller: &ReplicaController, store: &StateStore, name: &str) -> usize {
        let mut last = usize::MAX;
        for _ in 0..32 {
            controller.reconcile(name).unwrap();
            let now = children(store, name).len();
            if now == last {
                return now;
            }
            last = now;
        }
        panic!("replicas did not converge");
    }

    fn mark(store: &StateStore, pe: &ProblemEnvironment, condition: EnvironmentCondition) {
        let mut pe: ProblemEnvironment = store.get(&pe.metadata.name).unwrap().unwrap();
        set_condition(&mut pe, condition, ConditionStatus::True, "Test", "");
        store.update_status(&pe).unwrap();
    }

    #[test]
    fn converges_through_scale_changes() {
        let store = StateStore::open_in_memory().unwrap();
        let controller = ReplicaController::new(store.clone());
        store.create(test_problem("p1", 1)).unwrap();

        assert_eq!(converge(&controller, &store, "p1"), 1);

        set_replicas(&store, "p1", 5);
        assert_eq!(converge(&controller, &store, "p1"), 5);

        set_replicas(&store, "p1", 0);
        assert_eq!(converge(&controller, &store, "p1"), 0);

        set_replicas(&store, "p1", 3);
        assert_eq!(converge(&controller, &store, "p1"), 3);
    }

    #[test]
    fn creates_one_environment_per_pass() {
        let store = StateStore::open_in_memory().unwrap();
        let controller = ReplicaController::new(store.clone());
        store.create(test_problem("p1", 3)).unwrap();

        controller.reconcile("p1").unwrap();
        assert_eq!(children(&store, "p1").len(), 1);
    }

    #[test]
    fn environments_follow_template() {
        let store = StateStore::open_in_memory().unwrap();
        let controller = ReplicaController::new(store.clone());
        let problem = store.create(test_problem("p1", 1)).unwrap();
        controller.reconcile("p1").unwrap();

        let pe = &children(&store, "p1")[0];
        assert!(pe.metadata.name.starts_with("p1-"));
        assert_eq!(pe.metadata.labels.get("track").map(String::as_str), Some("routing"));
        assert_eq!(pe.metadata.labels.get(LABEL_PROBLEM_NAME).map(String::as_str), Some("p1"));
        assert_eq!(pe.metadata.annotations.get("score").map(String::as_str), Some("100"));
        assert!(pe.metadata.is_owned_by(&problem.metadata.uid));
        assert_eq!(pe.spec, problem.spec.template.spec);
        assert!(pe.spec.worker_name.is_empty());
    }

    #[test]
    fn assigned_environments_are_never_deleted() {
        let store = StateStore::open_in_memory().unwrap();
        let controller = ReplicaController::new(store.clone());
        store.create(test_problem("p1", 3)).unwrap();
        converge(&controller, &store, "p1");

        let assigned = children(&store, "p1")[1].clone();
        mark(&store, &assigned, EnvironmentCondition::Assigned);

        // One of three is assigned, so a fourth is created to keep three assignable.
        assert_eq!(converge(&controller, &store, "p1"), 4);

        set_replicas(&store, "p1", 0);
        assert_eq!(converge(&controller, &store, "p1"), 1);
        assert_eq!(children(&store, "p1")[0].metadata.name, assigned.metadata.name);
    }

    #[test]
    fn environment_claimed_after_listing_survives_scale_down() {
        let store = StateStore::open_in_memory().unwrap();
        let controller = ReplicaController::new(store.clone());
        store.create(test_problem("p1", 1)).unwrap();
        converge(&controller, &store, "p1");

        let mut problem: Problem = store.get("p1").unwrap().unwrap();
        let listed = controller.list_children(&problem).unwrap();
        assert_eq!(listed.len(), 1);

        // Claimed between the listing and the delete.
        mark(&store, &listed[0], EnvironmentCondition::Assigned);

        problem.spec.assignable_replicas = 0;
        controller.scale(&problem, &listed).unwrap();

        let remaining = children(&store, "p1");
        assert_eq!(remaining.len(), 1);
        assert!(get_condition(&remaining[0], EnvironmentCondition::Assigned).is_true());
    }

    #[test]
    fn status_counts_lifecycle_stages() {
        let store = StateStore::open_in_memory().unwrap();
        let controller = ReplicaController::new(store.clone());
        store.create(test_problem("p1", 3)).unwrap();
        converge(&controller, &store, "p1");

        let pes = children(&store, "p1");
        for pe in &pes {
            mark(&store, pe, EnvironmentCondition::Scheduled);
        }
        mark(&store, &pes[0], EnvironmentCondition::Ready);
        mark(&store, &pes[1], EnvironmentCondition::Ready);
        mark(&store, &pes[1], EnvironmentCondition::Assigned);

        converge(&controller, &store, "p1");
        let problem: Problem = store.get("p1").unwrap().unwrap();
        let replicas = problem.status.replicas;
        assert_eq!(replicas.total, 4);
        assert_eq!(replicas.scheduled, 3);
        assert_eq!(replicas.assignable, 1);
        assert_eq!(replicas.assigned, 1);
    }

    #[test]
    fn unchanged_status_is_not_rewritten() {
        let store = StateStore::open_in_memory().unwrap();
        let controller = ReplicaController::new(store.clone());
        store.create(test_problem("p1", 1)).unwrap();
        converge(&controller, &store, "p1");

        let before: Problem = store.get("p1").unwrap().unwrap();
        controller.reconcile("p1").unwrap();
        let after: Problem = store.get("p1").unwrap().unwrap();
        assert_eq!(before.metadata.resource_version, after.metadata.resource_version);
    }

    #[test]
    fn missing_problem_is_done() {
        let store = StateStore::open_in_memory().unwrap();
        let controller = ReplicaController::new(store);
        assert_eq!(controller.reconcile("ghost").unwrap(), Action::AwaitChange);
    }

    #[test]
    fn deleting_problem_only_refreshes_status() {
        let store = StateStore::open_in_memory().unwrap();
        let controller = ReplicaController::new(store.clone());
        let mut problem = test_problem("p1", 2);
        problem.metadata.finalizers.push("labgrid/test".to_string());
        store.create(problem).unwrap();
        controller.reconcile("p1").unwrap();
        assert_eq!(children(&store, "p1").len(), 1);

        store.delete::<Problem>("p1").unwrap();
        controller.reconcile("p1").unwrap();

        // The cascade removed the child and nothing new was created.
        assert!(children(&store, "p1").is_empty());
        let problem: Problem = store.get("p1").unwrap().unwrap();
        assert_eq!(problem.status.replicas.total, 0);
    }

    #[test]
    fn released_environment_is_replaced() {
        let store = StateStore::open_in_memory().unwrap();
        let controller = ReplicaController::new(store.clone());
        store.create(test_problem("p1", 1)).unwrap();
        converge(&controller, &store, "p1");

        let pe = children(&store, "p1")[0].clone();
        mark(&store, &pe, EnvironmentCondition::Assigned);
        converge(&controller, &store, "p1");
        assert_eq!(children(&store, "p1").len(), 2);

        store.delete::<ProblemEnvironment>(&pe.metadata.name).unwrap();
        assert_eq!(converge(&controller, &store, "p1"), 1);
        assert_ne!(children(&store, "p1")[0].metadata.name, pe.metadata.name);
    }

    #[tokio::test]
    async fn controller_drives_replicas_from_watch_events() {
        let store = StateStore::open_in_memory().unwrap();
        let (tx, rx) = tokio::sync::watch::channel(false);
        let controller = Controller::new(store.clone(), ReplicaController::new(store.clone()));
        let handle = tokio::spawn(controller.run(rx));

        store.create(test_problem("p1", 3)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while children(&store, "p1").len() < 3 {
            assert!(std::time::Instant::now() < deadline, "replicas not created in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
