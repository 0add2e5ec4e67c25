//! Controller — drives a [`Reconciler`] from store change notifications.
//!
//! The controller subscribes to the store's watch channel, turns each event
//! into the keys of the primary objects it affects and feeds them through a
//! [`WorkQueue`]. Reconciles run on the blocking pool (store access is
//! synchronous), at most `workers` at a time and never two for the same key.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::{Id, JoinSet};
use tracing::{debug, error, info, warn};

use labgrid_state::{ResourceKind, StateStore, WatchEvent};

use crate::error::{ReconcileError, ReconcileResult};
use crate::queue::WorkQueue;

/// Default number of keys reconciled concurrently.
pub const DEFAULT_WORKERS: usize = 4;

/// What to do with a key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do until the object (or something it owns) changes.
    AwaitChange,
    /// Run again after the given delay even if nothing changes.
    RequeueAfter(Duration),
}

/// A level-triggered reconcile function for one kind of object.
pub trait Reconciler: Send + Sync + 'static {
    type Error: Display + Send + 'static;

    /// Name used in logs.
    const NAME: &'static str;

    /// Kind whose objects are reconciled; keys are its table keys.
    const KIND: ResourceKind;

    /// Kinds whose changes trigger a reconcile of their owner.
    const OWNS: &'static [ResourceKind] = &[];

    /// Bring the object named `key` towards its desired state.
    fn reconcile(&self, key: &str) -> Result<Action, Self::Error>;
}

/// Runs a reconciler until shutdown.
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    store: StateStore,
    workers: usize,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(store: StateStore, reconciler: R) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            store,
            workers: DEFAULT_WORKERS,
        }
    }

    /// Set how many different keys may be reconciled at the same time.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Keys of primary objects affected by a change notification.
    fn keys_for(event: &WatchEvent) -> Vec<String> {
        if event.kind == R::KIND {
            return vec![event.name.clone()];
        }
        if R::OWNS.contains(&event.kind) {
            return event
                .owners
                .iter()
                .filter(|owner| owner.kind == R::KIND)
                .map(|owner| owner.name.clone())
                .collect();
        }
        Vec::new()
    }

    fn resync(&self, queue: &mut WorkQueue) -> ReconcileResult<usize> {
        let keys = self.store.keys(R::KIND)?;
        for key in &keys {
            queue.add(key);
        }
        Ok(keys.len())
    }

    /// Run the control loop until `shutdown` fires.
    ///
    /// Every existing object is reconciled once at start. In-flight
    /// reconciles are allowed to finish before returning.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ReconcileResult<()> {
        // Subscribe before listing so no change slips between the two.
        let mut events = self.store.watch();
        let mut queue = WorkQueue::new();
        let initial = self.resync(&mut queue)?;
        info!(controller = R::NAME, workers = self.workers, initial, "controller started");

        let mut tasks: JoinSet<(String, Result<Action, R::Error>)> = JoinSet::new();
        let mut running: HashMap<Id, String> = HashMap::new();

        loop {
            let now = Instant::now();
            while tasks.len() < self.workers {
                let Some(key) = queue.pop(now) else { break };
                let reconciler = Arc::clone(&self.reconciler);
                let task_key = key.clone();
                let handle = tasks.spawn_blocking(move || {
                    let result = reconciler.reconcile(&task_key);
                    (task_key, result)
                });
                running.insert(handle.id(), key);
            }

            let deadline = queue.next_deadline();
            let sleep = tokio::time::sleep_until(
                deadline
                    .map(tokio::time::Instant::from_std)
                    .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600)),
            );

            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(controller = R::NAME, "controller shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        for key in Self::keys_for(&event) {
                            queue.add(&key);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(controller = R::NAME, missed, "watch lagged, resyncing");
                        if let Err(e) = self.resync(&mut queue) {
                            error!(controller = R::NAME, error = %e, "resync failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        tasks.shutdown().await;
                        return Err(ReconcileError::WatchClosed);
                    }
                },
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    let now = Instant::now();
                    match joined {
                        Ok((id, (key, result))) => {
                            running.remove(&id);
                            self.finish(&mut queue, &key, result, now);
                        }
                        Err(e) => {
                            if let Some(key) = running.remove(&e.id()) {
                                let delay = queue.record_failure(&key);
                                error!(
                                    controller = R::NAME,
                                    %key,
                                    error = %e,
                                    retry_in = ?delay,
                                    "reconcile task failed"
                                );
                                queue.done(&key, Some(delay), now);
                            }
                        }
                    }
                }
                _ = sleep, if deadline.is_some() => {}
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(controller = R::NAME, error = %e, "reconcile task failed during shutdown");
            }
        }
        info!(controller = R::NAME, "controller stopped");
        Ok(())
    }

    fn finish(
        &self,
        queue: &mut WorkQueue,
        key: &str,
        result: Result<Action, R::Error>,
        now: Instant,
    ) {
        match result {
            Ok(Action::AwaitChange) => {
                queue.record_success(key);
                queue.done(key, None, now);
            }
            Ok(Action::RequeueAfter(delay)) => {
                queue.record_success(key);
                debug!(controller = R::NAME, %key, ?delay, "requeue");
                queue.done(key, Some(delay), now);
            }
            Err(e) => {
                let delay = queue.record_failure(key);
                warn!(
                    controller = R::NAME,
                    %key,
                    error = %e,
                    retry_in = ?delay,
                    "reconcile failed"
                );
                queue.done(key, Some(delay), now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use labgrid_state::*;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail_first: AtomicU32,
    }

    struct ProblemRecorder(Arc<Recorder>);

    impl Reconciler for ProblemRecorder {
        type Error = String;
        const NAME: &'static str = "recorder";
        const KIND: ResourceKind = ResourceKind::Problem;
        const OWNS: &'static [ResourceKind] = &[ResourceKind::ProblemEnvironment];

        fn reconcile(&self, key: &str) -> Result<Action, String> {
            self.0.seen.lock().unwrap().push(key.to_string());
            if self.0.fail_first.load(Ordering::SeqCst) > 0 {
                self.0.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err("boom".to_string());
            }
            Ok(Action::AwaitChange)
        }
    }

    fn problem(name: &str) -> Problem {
        Problem::new(ObjectMeta::named(name), ProblemSpec::default())
    }

    fn count(recorder: &Recorder, key: &str) -> usize {
        recorder.seen.lock().unwrap().iter().filter(|k| *k == key).count()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn start(
        store: &StateStore,
        recorder: &Arc<Recorder>,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<ReconcileResult<()>>) {
        let (tx, rx) = watch::channel(false);
        let controller = Controller::new(store.clone(), ProblemRecorder(Arc::clone(recorder)));
        let handle = tokio::spawn(controller.run(rx));
        (tx, handle)
    }

    #[tokio::test]
    async fn existing_objects_are_reconciled_on_start() {
        let store = StateStore::open_in_memory().unwrap();
        store.create(problem("p1")).unwrap();
        store.create(problem("p2")).unwrap();

        let recorder = Arc::new(Recorder::default());
        let (tx, handle) = start(&store, &recorder);

        wait_until(|| count(&recorder, "p1") >= 1 && count(&recorder, "p2") >= 1).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn owned_object_changes_trigger_owner() {
        let store = StateStore::open_in_memory().unwrap();
        let owner = store.create(problem("p1")).unwrap();

        let recorder = Arc::new(Recorder::default());
        let (tx, handle) = start(&store, &recorder);
        wait_until(|| count(&recorder, "p1") >= 1).await;
        let before = count(&recorder, "p1");

        let mut meta = ObjectMeta::named("p1-abcde");
        meta.owner_references
            .push(owner.metadata.owner_reference(ResourceKind::Problem));
        store
            .create(ProblemEnvironment::new(meta, EnvironmentSpec::default()))
            .unwrap();

        wait_until(|| count(&recorder, "p1") > before).await;
        assert_eq!(count(&recorder, "p1-abcde"), 0);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unrelated_kinds_are_ignored() {
        let store = StateStore::open_in_memory().unwrap();
        let recorder = Arc::new(Recorder::default());
        let (tx, handle) = start(&store, &recorder);

        store
            .create(Worker::new(ObjectMeta::named("w1"), WorkerSpec::default()))
            .unwrap();
        store.create(problem("p1")).unwrap();

        wait_until(|| count(&recorder, "p1") >= 1).await;
        assert_eq!(count(&recorder, "w1"), 0);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_reconcile_is_retried() {
        let store = StateStore::open_in_memory().unwrap();
        store.create(problem("p1")).unwrap();

        let recorder = Arc::new(Recorder {
            fail_first: AtomicU32::new(2),
            ..Default::default()
        });
        let (tx, handle) = start(&store, &recorder);

        // 100 ms then 200 ms of backoff before the third, successful pass.
        wait_until(|| count(&recorder, "p1") >= 3).await;
        assert_eq!(recorder.fail_first.load(Ordering::SeqCst), 0);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    struct Requeuer(Arc<Recorder>);

    impl Reconciler for Requeuer {
        type Error = String;
        const NAME: &'static str = "requeuer";
        const KIND: ResourceKind = ResourceKind::Worker;

        fn reconcile(&self, key: &str) -> Result<Action, String> {
            self.0.seen.lock().unwrap().push(key.to_string());
            Ok(Action::RequeueAfter(Duration::from_millis(50)))
        }
    }

    #[tokio::test]
    async fn requeue_after_runs_again_without_changes() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create(Worker::new(ObjectMeta::named("w1"), WorkerSpec::default()))
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = watch::channel(false);
        let controller =
            Controller::new(store.clone(), Requeuer(Arc::clone(&recorder))).with_workers(1);
        let handle = tokio::spawn(controller.run(rx));

        wait_until(|| count(&recorder, "w1") >= 3).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
